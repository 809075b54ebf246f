use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use harvest_core::collect::{CancelToken, CollectionStateMachine, RunOutcome};
use harvest_core::config::{CollectionSection, PageSection};
use harvest_core::session::{BrowserSession, ElementHandle, PageGeometry, SessionResult};

const VIEWPORT: f64 = 1000.0;

/// Serves a scripted batch of rendered cards per iteration. Affordances are
/// toggled by flags and matched on the selector strings from `page_config`.
struct FeedSession {
    batches: Mutex<VecDeque<Vec<ElementHandle>>>,
    grid_present: bool,
    load_more_present: bool,
    retry_visible: AtomicBool,
    retry_clicks: AtomicUsize,
    navigations: AtomicUsize,
    harvest_calls: AtomicUsize,
}

impl FeedSession {
    fn new(batches: Vec<Vec<ElementHandle>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            grid_present: true,
            load_more_present: false,
            retry_visible: AtomicBool::new(false),
            retry_clicks: AtomicUsize::new(0),
            navigations: AtomicUsize::new(0),
            harvest_calls: AtomicUsize::new(0),
        }
    }

    fn empty_page() -> Self {
        let mut session = Self::new(Vec::new());
        session.grid_present = false;
        session
    }
}

fn card(id: &str, index: i64, badge: &str, top: f64) -> ElementHandle {
    ElementHandle {
        test_id: Some(id.to_string()),
        test_index: Some(index),
        badge_text: badge.to_string(),
        top,
        height: 50.0,
        displayed: true,
    }
}

fn affordance() -> ElementHandle {
    ElementHandle {
        test_id: None,
        test_index: None,
        badge_text: String::new(),
        top: 0.0,
        height: 10.0,
        displayed: true,
    }
}

#[async_trait]
impl BrowserSession for FeedSession {
    async fn navigate(&self, _url: &str) -> SessionResult<()> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, _script: &str) -> SessionResult<Value> {
        Ok(Value::Null)
    }

    async fn query_visible(&self, _selector: &str) -> SessionResult<Vec<ElementHandle>> {
        self.harvest_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn find_optional(&self, selector: &str) -> SessionResult<Option<ElementHandle>> {
        if selector == "#retry" {
            if self.retry_visible.load(Ordering::SeqCst) {
                return Ok(Some(affordance()));
            }
            return Ok(None);
        }
        if selector == "#load-more" {
            if self.load_more_present {
                return Ok(Some(affordance()));
            }
            return Ok(None);
        }
        if selector == "#grid" {
            if self.grid_present {
                return Ok(Some(affordance()));
            }
            return Ok(None);
        }
        // Next-index jump target is never locatable in the scripted feed.
        Ok(None)
    }

    async fn click(&self, selector: &str) -> SessionResult<()> {
        if selector == "#retry" {
            self.retry_clicks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn geometry(&self) -> SessionResult<PageGeometry> {
        Ok(PageGeometry {
            viewport_height: VIEWPORT,
            page_height: 50_000.0,
            scroll_top: 0.0,
        })
    }

    async fn scroll_to(&self, _top: f64) -> SessionResult<()> {
        Ok(())
    }

    async fn scroll_into_view(&self, _selector: &str) -> SessionResult<()> {
        Ok(())
    }

    async fn probe_alive(&self) -> bool {
        true
    }

    async fn close(&self) -> SessionResult<()> {
        Ok(())
    }
}

fn collection_config(max_items: usize) -> CollectionSection {
    CollectionSection {
        max_items,
        stall_timeout_seconds: 30,
        max_consecutive_stalls: 3,
        max_connection_retries: 5,
        iteration_delay_ms: [1, 2],
        retry_settle_seconds: 0,
        initial_settle_seconds: 0,
    }
}

fn page_config() -> PageSection {
    PageSection {
        listing_url: "https://example.com/deals".into(),
        grid_selector: "#grid".into(),
        card_selector: ".card".into(),
        badge_selector: ".badge".into(),
        next_index_selector: "#card-{index}".into(),
        retry_selector: "#retry".into(),
        load_more_selector: "#load-more".into(),
        item_url_template: "https://example.com/dp/{id}".into(),
    }
}

fn machine(max_items: usize) -> CollectionStateMachine {
    CollectionStateMachine::new(collection_config(max_items), page_config())
}

#[tokio::test]
async fn run_completes_when_target_is_reached() {
    let session = FeedSession::new(vec![
        vec![card("B001", 0, "20% off", 100.0), card("B002", 1, "15% off", 200.0)],
        vec![card("B003", 2, "$5 off", 100.0), card("B004", 3, "30% off", 200.0)],
        vec![card("B005", 4, "10% off", 100.0), card("B006", 5, "25% off", 200.0)],
    ]);

    let run = machine(5)
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(run.outcome, RunOutcome::Completed);
    assert!(run.outcome.is_success());
    assert_eq!(run.records.len(), 5);
    assert_eq!(run.report.unique_count, 5);
    assert_eq!(run.report.duplicate_count, 0);
    let ids: Vec<&str> = run.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["B001", "B002", "B003", "B004", "B005"]);
    assert_eq!(run.records[0].url, "https://example.com/dp/B001");
}

#[tokio::test]
async fn exhausted_after_stall_ceiling_without_load_more() {
    let session = FeedSession::new(vec![vec![
        card("B001", 0, "20% off", 100.0),
        card("B002", 1, "15% off", 200.0),
    ]]);

    let run = machine(100)
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(run.outcome, RunOutcome::Exhausted);
    assert!(!run.outcome.is_success());
    assert_eq!(run.report.unique_count, 2);
    // One productive iteration plus three consecutive stalls.
    assert_eq!(session.harvest_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn duplicate_identifier_is_recorded_once() {
    // The page re-lists B001 later under a fresh index.
    let session = FeedSession::new(vec![
        vec![card("B001", 0, "20% off", 100.0), card("B002", 1, "15% off", 200.0)],
        vec![card("B001", 2, "20% off", 100.0)],
    ]);

    let run = machine(100)
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(run.records.len(), 2);
    assert_eq!(run.report.unique_count, 2);
    assert_eq!(run.report.duplicate_count, 1);
    assert_eq!(run.report.total_seen, 3);
}

#[tokio::test]
async fn persistent_connection_problem_fails_the_run() {
    let session = FeedSession::new(vec![vec![card("B001", 0, "20% off", 100.0)]]);
    session.retry_visible.store(true, Ordering::SeqCst);

    let run = machine(100)
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(run.outcome, RunOutcome::ConnectionFailed);
    assert!(run.records.is_empty());
    assert_eq!(session.retry_clicks.load(Ordering::SeqCst), 5);
    // No harvesting happens while the retry affordance is up.
    assert_eq!(session.harvest_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_page_is_a_valid_no_results_run() {
    let session = FeedSession::empty_page();

    let run = machine(100)
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(run.outcome, RunOutcome::NoResults);
    assert!(run.records.is_empty());
    assert_eq!(run.report.unique_count, 0);
    assert_eq!(run.report.duplicate_count, 0);
}

#[tokio::test]
async fn stall_timeout_ends_the_run() {
    let mut session = FeedSession::new(vec![vec![card("B001", 0, "20% off", 100.0)]]);
    // A visible load-more keeps the exhaustion heuristic out of the way.
    session.load_more_present = true;

    let mut config = collection_config(100);
    config.stall_timeout_seconds = 0;
    let machine = CollectionStateMachine::new(config, page_config());

    let run = machine
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(run.outcome, RunOutcome::Stalled);
    assert_eq!(run.report.unique_count, 1);
}

#[tokio::test]
async fn cancelled_token_short_circuits_the_run() {
    let session = FeedSession::new(vec![vec![card("B001", 0, "20% off", 100.0)]]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let run = machine(100).collect(&session, &cancel).await.unwrap();

    assert_eq!(run.outcome, RunOutcome::Cancelled);
    assert!(run.records.is_empty());
    assert_eq!(session.navigations.load(Ordering::SeqCst), 1);
    assert_eq!(session.harvest_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn partially_visible_card_is_deferred_not_lost() {
    // B002 straddles the viewport edge in the first pass and is fully
    // visible in the second.
    let session = FeedSession::new(vec![
        vec![card("B001", 0, "20% off", 100.0), {
            let mut below = card("B002", 1, "15% off", 980.0);
            below.height = 100.0;
            below
        }],
        vec![card("B002", 1, "15% off", 100.0)],
    ]);

    let run = machine(100)
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = run.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["B001", "B002"]);
    assert_eq!(run.report.unique_count, 2);
    assert_eq!(run.report.duplicate_count, 0);
}

#[tokio::test]
async fn unparseable_or_unidentified_cards_are_skipped() {
    let mut anonymous = card("ignored", 1, "40% off", 200.0);
    anonymous.test_id = None;
    let session = FeedSession::new(vec![vec![
        card("B001", 0, "20% off", 100.0),
        anonymous,
        card("B003", 2, "free shipping", 300.0),
    ]]);

    let run = machine(100)
        .collect(&session, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(run.records.len(), 1);
    assert_eq!(run.records[0].id, "B001");
    assert_eq!(run.report.unique_count, 1);
    assert_eq!(run.report.duplicate_count, 0);
}
