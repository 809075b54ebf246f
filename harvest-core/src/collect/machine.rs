use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{CollectionSection, PageSection};
use crate::session::{BrowserSession, ElementHandle, SessionResult};

use super::parse::{Coupon, CouponParser};
use super::stats::{CrawlReport, CrawlStats, DedupTracker};

/// Fraction of the viewport re-shown after a plain scroll step, so items
/// straddling the old viewport edge are seen again.
const VIEWPORT_OVERLAP: f64 = 0.2;

/// Run-level cancellation signal, checked at the top of every iteration and
/// across every pacing sleep.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.inner.notify.notified().await;
        }
    }

    /// Sleep that wakes early on cancellation; returns `true` if cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        if duration.is_zero() {
            return false;
        }
        tokio::select! {
            _ = sleep(duration) => false,
            _ = self.cancelled() => true,
        }
    }
}

/// Why a collection run ended. A zero-result run is a valid terminal state,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The target item count was reached.
    Completed,
    /// No page content area was detected at all.
    NoResults,
    /// Too long since the last iteration that yielded a new unique item.
    Stalled,
    /// Stall ceiling reached with no load-more affordance left to try.
    Exhausted,
    /// The page's retry affordance kept reappearing past the ceiling.
    ConnectionFailed,
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunOutcome::Completed => "completed",
            RunOutcome::NoResults => "no_results",
            RunOutcome::Stalled => "stalled",
            RunOutcome::Exhausted => "exhausted",
            RunOutcome::ConnectionFailed => "connection_failed",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrawlPhase {
    ItemFound,
    Stall,
    NoResults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrollAction {
    JumpToIndex,
    Step,
    LoadMore,
    BottomAnchor,
    Held,
}

/// One collected listing. Immutable after creation; created at most once per
/// dedup identifier within a run.
#[derive(Debug, Clone, Serialize)]
pub struct DealRecord {
    pub id: String,
    pub url: String,
    pub index: i64,
    pub coupon: Coupon,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CollectionRun {
    pub records: Vec<DealRecord>,
    pub outcome: RunOutcome,
    pub report: CrawlReport,
}

/// Drives one leased session through the scroll/harvest/dedup/terminate
/// loop. Strictly sequential within a run; owns its stats and seen-set, so
/// no locking is needed around them.
pub struct CollectionStateMachine {
    collection: CollectionSection,
    page: PageSection,
    parser: CouponParser,
}

impl CollectionStateMachine {
    pub fn new(collection: CollectionSection, page: PageSection) -> Self {
        Self {
            collection,
            page,
            parser: CouponParser::new(),
        }
    }

    pub async fn collect(
        &self,
        session: &dyn BrowserSession,
        cancel: &CancelToken,
    ) -> SessionResult<CollectionRun> {
        let run_start = Instant::now();
        let mut stats = CrawlStats::new();
        let mut tracker = DedupTracker::new();
        let mut records: Vec<DealRecord> = Vec::new();

        info!(
            url = %self.page.listing_url,
            max_items = self.collection.max_items,
            stall_timeout_secs = self.collection.stall_timeout_seconds,
            "starting collection run"
        );
        session.navigate(&self.page.listing_url).await?;
        if cancel.pause(self.collection.initial_settle()).await {
            return Ok(self.finish(records, RunOutcome::Cancelled, stats, run_start));
        }

        let mut scroll_count: u32 = 0;
        let mut consecutive_stalls: u32 = 0;
        let mut connection_retries: u32 = 0;
        let mut last_progress = Instant::now();

        let outcome = loop {
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }
            scroll_count += 1;

            match self.handle_connection_problem(session).await {
                ConnectionCheck::Retrying => {
                    connection_retries += 1;
                    if connection_retries >= self.collection.max_connection_retries {
                        warn!(retries = connection_retries, "connection problem persists, giving up");
                        break RunOutcome::ConnectionFailed;
                    }
                    if cancel.pause(self.collection.retry_settle()).await {
                        break RunOutcome::Cancelled;
                    }
                    continue;
                }
                ConnectionCheck::Clear => connection_retries = 0,
            }

            let action = self.advance(session, stats.last_index).await;
            debug!(scroll = scroll_count, action = ?action, last_index = stats.last_index, "scroll advance");

            let (new_items, content_present) = self
                .harvest(session, &mut stats, &mut tracker, &mut records)
                .await;

            let phase = if new_items > 0 {
                last_progress = Instant::now();
                consecutive_stalls = 0;
                CrawlPhase::ItemFound
            } else if !content_present {
                CrawlPhase::NoResults
            } else {
                consecutive_stalls += 1;
                CrawlPhase::Stall
            };
            debug!(
                scroll = scroll_count,
                phase = ?phase,
                new_items,
                unique = stats.unique_count,
                duplicates = stats.duplicate_count,
                "iteration finished"
            );

            if let Some(outcome) = self
                .evaluate_termination(
                    session,
                    records.len(),
                    content_present,
                    last_progress,
                    consecutive_stalls,
                )
                .await
            {
                break outcome;
            }

            let delay = pacing_delay(self.collection.iteration_delay_ms, stats.duplicate_rate());
            if cancel.pause(delay).await {
                break RunOutcome::Cancelled;
            }
        };

        Ok(self.finish(records, outcome, stats, run_start))
    }

    fn finish(
        &self,
        records: Vec<DealRecord>,
        outcome: RunOutcome,
        stats: CrawlStats,
        run_start: Instant,
    ) -> CollectionRun {
        let report = stats.snapshot(run_start.elapsed());
        info!(
            outcome = %outcome,
            unique = report.unique_count,
            duplicates = report.duplicate_count,
            duration_secs = report.duration_secs,
            "collection run finished"
        );
        CollectionRun {
            records,
            outcome,
            report,
        }
    }

    async fn handle_connection_problem(&self, session: &dyn BrowserSession) -> ConnectionCheck {
        match session.find_optional(&self.page.retry_selector).await {
            Ok(Some(button)) if button.displayed => {
                warn!("connection problem detected, clicking retry");
                if let Err(err) = session.click(&self.page.retry_selector).await {
                    debug!(error = %err, "retry click failed");
                }
                ConnectionCheck::Retrying
            }
            Ok(_) => ConnectionCheck::Clear,
            Err(err) => {
                debug!(error = %err, "retry affordance lookup failed");
                ConnectionCheck::Clear
            }
        }
    }

    /// Locality-preserving scroll: jump straight to the next unprocessed
    /// index when it is locatable, otherwise step one viewport minus the
    /// overlap; near the bottom, try the load-more affordance before
    /// anchoring to the page end.
    async fn advance(&self, session: &dyn BrowserSession, last_index: i64) -> ScrollAction {
        let next_selector = self.page.next_index_selector(last_index + 1);
        match session.find_optional(&next_selector).await {
            Ok(Some(_)) => {
                if session.scroll_into_view(&next_selector).await.is_ok() {
                    return ScrollAction::JumpToIndex;
                }
            }
            Ok(None) => {}
            Err(err) => debug!(error = %err, "next-index lookup failed"),
        }

        let geometry = match session.geometry().await {
            Ok(geometry) => geometry,
            Err(err) => {
                warn!(error = %err, "page geometry unavailable, holding position");
                return ScrollAction::Held;
            }
        };

        if geometry.near_bottom() {
            if let Ok(Some(button)) = session.find_optional(&self.page.load_more_selector).await {
                if button.displayed {
                    let _ = session.scroll_into_view(&self.page.load_more_selector).await;
                    if session.click(&self.page.load_more_selector).await.is_ok() {
                        debug!("clicked load-more affordance");
                        return ScrollAction::LoadMore;
                    }
                }
            }
            // Bottom-anchored jiggle to coax lazy loading.
            let _ = session.scroll_to(geometry.page_height).await;
            let _ = session.scroll_to(geometry.page_height - 200.0).await;
            let _ = session.scroll_to(geometry.page_height).await;
            return ScrollAction::BottomAnchor;
        }

        let step = geometry.viewport_height * (1.0 - VIEWPORT_OVERLAP);
        let next = (geometry.scroll_top + step)
            .min((geometry.page_height - geometry.viewport_height).max(0.0));
        let _ = session.scroll_to(next).await;
        ScrollAction::Step
    }

    /// Enumerate visible candidates, keep the unprocessed fully-visible
    /// ones, extract and dedup. Returns the number of new unique records and
    /// whether any content area was detected at all.
    async fn harvest(
        &self,
        session: &dyn BrowserSession,
        stats: &mut CrawlStats,
        tracker: &mut DedupTracker,
        records: &mut Vec<DealRecord>,
    ) -> (usize, bool) {
        let cards = match session.query_visible(&self.page.card_selector).await {
            Ok(cards) => cards,
            Err(err) => {
                warn!(error = %err, "visible-card enumeration failed");
                Vec::new()
            }
        };

        let content_present = if cards.is_empty() {
            matches!(
                session.find_optional(&self.page.grid_selector).await,
                Ok(Some(_))
            )
        } else {
            true
        };

        let geometry = match session.geometry().await {
            Ok(geometry) => geometry,
            Err(err) => {
                warn!(error = %err, "geometry unavailable, skipping harvest");
                return (0, content_present);
            }
        };

        // Strict index ordering: anything at or below last_index was already
        // handled, so replaying a viewport never double-counts.
        let mut indexed: Vec<(i64, ElementHandle)> = cards
            .into_iter()
            .filter(|card| card.displayed)
            .filter_map(|card| card.test_index.map(|index| (index, card)))
            .filter(|(index, _)| *index > stats.last_index)
            .collect();
        indexed.sort_by_key(|(index, _)| *index);

        let mut new_items = 0;
        for (index, card) in indexed {
            if records.len() >= self.collection.max_items {
                break;
            }
            if !card.fully_visible(&geometry) {
                debug!(index, "partially visible, deferring to next iteration");
                continue;
            }
            let Some(id) = card.test_id.clone() else {
                continue;
            };
            // Per-element extraction failure is isolated: skip and continue.
            let Some(coupon) = self.parser.parse(&card.badge_text) else {
                debug!(id = %id, index, "no coupon value on card, skipping");
                continue;
            };
            if !tracker.insert(&id) {
                stats.record_duplicate();
                debug!(id = %id, "duplicate identifier");
                continue;
            }
            stats.record_seen(index);
            stats.update_category_average(coupon.kind, coupon.value);
            records.push(DealRecord {
                url: self.page.item_url(&id),
                id,
                index,
                coupon,
                collected_at: Utc::now(),
            });
            new_items += 1;
        }

        (new_items, content_present)
    }

    /// Ordered termination policy; the first matching condition wins. The
    /// precedence is a policy choice kept in one place on purpose.
    async fn evaluate_termination(
        &self,
        session: &dyn BrowserSession,
        collected: usize,
        content_present: bool,
        last_progress: Instant,
        consecutive_stalls: u32,
    ) -> Option<RunOutcome> {
        if collected >= self.collection.max_items {
            return Some(RunOutcome::Completed);
        }
        if !content_present {
            return Some(RunOutcome::NoResults);
        }
        if last_progress.elapsed() > self.collection.stall_timeout() {
            return Some(RunOutcome::Stalled);
        }
        if consecutive_stalls >= self.collection.max_consecutive_stalls {
            let load_more_present = matches!(
                session.find_optional(&self.page.load_more_selector).await,
                Ok(Some(button)) if button.displayed
            );
            if !load_more_present {
                return Some(RunOutcome::Exhausted);
            }
        }
        None
    }
}

enum ConnectionCheck {
    Retrying,
    Clear,
}

/// Sleep length between iterations: a jittered base that stretches as the
/// duplicate rate climbs, since a page re-showing seen content rewards
/// patience more than speed.
fn pacing_delay(range_ms: [u64; 2], duplicate_rate: f64) -> Duration {
    let [lo, hi] = range_ms;
    let base = if lo >= hi {
        lo
    } else {
        rand::thread_rng().gen_range(lo..=hi)
    };
    let factor = 1.0 + duplicate_rate.clamp(0.0, 1.0) * 2.0;
    Duration::from_millis((base as f64 * factor).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_stays_in_base_range_without_duplicates() {
        for _ in 0..50 {
            let delay = pacing_delay([100, 200], 0.0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn pacing_stretches_with_duplicate_rate() {
        let calm = pacing_delay([100, 100], 0.0);
        let half = pacing_delay([100, 100], 0.5);
        let saturated = pacing_delay([100, 100], 1.0);
        assert_eq!(calm, Duration::from_millis(100));
        assert_eq!(half, Duration::from_millis(200));
        assert_eq!(saturated, Duration::from_millis(300));
    }

    #[test]
    fn cancel_token_reports_state() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
