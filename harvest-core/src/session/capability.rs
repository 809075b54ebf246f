use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::error::SessionResult;

/// Snapshot of one candidate element currently rendered in the page.
///
/// Handles are plain data: the driving loop filters and parses them without
/// calling back into the browser, so a stale handle can never crash a run.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementHandle {
    /// Stable dedup identifier carried by the element, when present.
    pub test_id: Option<String>,
    /// Monotonic position of the element in the listing, when present.
    pub test_index: Option<i64>,
    /// Inner text of the element's value badge, empty when absent.
    #[serde(default)]
    pub badge_text: String,
    /// Document-space top edge in CSS pixels.
    pub top: f64,
    pub height: f64,
    pub displayed: bool,
}

impl ElementHandle {
    pub fn fully_visible(&self, geometry: &PageGeometry) -> bool {
        self.top >= geometry.scroll_top
            && self.top + self.height <= geometry.scroll_top + geometry.viewport_height
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageGeometry {
    pub viewport_height: f64,
    pub page_height: f64,
    pub scroll_top: f64,
}

impl PageGeometry {
    pub fn near_bottom(&self) -> bool {
        self.page_height - (self.scroll_top + self.viewport_height) < self.viewport_height
    }
}

/// Capability interface over one running automated browser instance.
///
/// The pool, monitor and collection loop depend only on this trait; the
/// chromium backend is one implementation, test doubles are another.
/// Affordance lookups return `Option` rather than erroring when the element
/// is absent: absence is an ordinary state of the page, not a failure.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> SessionResult<()>;

    async fn execute(&self, script: &str) -> SessionResult<Value>;

    /// Enumerate rendered elements matching `selector`, as data snapshots.
    async fn query_visible(&self, selector: &str) -> SessionResult<Vec<ElementHandle>>;

    /// Locate a single affordance; `None` when it is not on the page.
    async fn find_optional(&self, selector: &str) -> SessionResult<Option<ElementHandle>>;

    async fn click(&self, selector: &str) -> SessionResult<()>;

    async fn geometry(&self) -> SessionResult<PageGeometry>;

    async fn scroll_to(&self, top: f64) -> SessionResult<()>;

    async fn scroll_into_view(&self, selector: &str) -> SessionResult<()>;

    /// Cheap liveness probe; must not error, a dead session reports `false`.
    async fn probe_alive(&self) -> bool;

    async fn close(&self) -> SessionResult<()>;
}

/// Creates sessions for the pool. Creation is expensive (seconds) and may
/// fail; callers are expected to retry opportunistically.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> SessionResult<Arc<dyn BrowserSession>>;
}
