use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumLaunchConfig};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ChromiumSection, FlagsSection, PageSection};

use super::capability::{BrowserSession, ElementHandle, PageGeometry, SessionFactory};
use super::error::{SessionError, SessionResult};

/// Launches one Chromium instance per session. A session owns its browser
/// process outright, so evicting a broken session never disturbs another.
#[derive(Debug, Clone)]
pub struct ChromiumSessionFactory {
    chromium: Arc<ChromiumSection>,
    flags: Arc<FlagsSection>,
    badge_selector: Arc<str>,
}

impl ChromiumSessionFactory {
    pub fn new(chromium: ChromiumSection, flags: FlagsSection, page: &PageSection) -> Self {
        Self {
            chromium: Arc::new(chromium),
            flags: Arc::new(flags),
            badge_selector: Arc::from(page.badge_selector.as_str()),
        }
    }

    fn build_launch_config(&self) -> SessionResult<ChromiumLaunchConfig> {
        let mut builder = ChromiumLaunchConfig::builder().window_size(
            self.chromium.window_width,
            self.chromium.window_height,
        );

        if let Some(path) = &self.chromium.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.chromium.headless {
            builder = builder.with_head();
        }
        if !self.chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.chromium.page_load_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![
            format!("--user-agent={}", self.chromium.user_agent),
            format!(
                "--window-size={},{}",
                self.chromium.window_width, self.chromium.window_height
            ),
            "--disable-dev-shm-usage".to_string(),
        ];
        if self.chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if self.flags.mute_audio {
            args.push("--mute-audio".into());
        }
        if self.flags.no_first_run {
            args.push("--no-first-run".into());
        }
        if self.flags.disable_automation_controlled {
            args.push("--disable-features=AutomationControlled".into());
        }
        for feature in &self.flags.disable_blink_features {
            args.push(format!("--disable-blink-features={feature}"));
        }
        if let Some(lang) = &self.flags.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(accept) = &self.flags.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        builder = builder.args(args);

        builder.build().map_err(SessionError::Configuration)
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn create(&self) -> SessionResult<Arc<dyn BrowserSession>> {
        let launch_config = self.build_launch_config()?;
        info!(
            headless = self.chromium.headless,
            width = self.chromium.window_width,
            height = self.chromium.window_height,
            "launching chromium session"
        );

        let (browser, mut handler) = Browser::launch(launch_config)
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;

        Ok(Arc::new(ChromiumSession {
            browser: AsyncMutex::new(browser),
            page,
            handler_task: AsyncMutex::new(Some(handler_task)),
            badge_selector: Arc::clone(&self.badge_selector),
        }))
    }
}

pub struct ChromiumSession {
    browser: AsyncMutex<Browser>,
    page: Page,
    handler_task: AsyncMutex<Option<JoinHandle<()>>>,
    badge_selector: Arc<str>,
}

impl ChromiumSession {
    async fn evaluate(&self, script: &str) -> SessionResult<Value> {
        let result = self.page.evaluate(script).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&self, url: &str) -> SessionResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(SessionError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn execute(&self, script: &str) -> SessionResult<Value> {
        self.evaluate(script).await
    }

    async fn query_visible(&self, selector: &str) -> SessionResult<Vec<ElementHandle>> {
        let script = format!(
            r#"(() => {{
    const badgeSel = {badge};
    return Array.from(document.querySelectorAll({sel})).map((el) => {{
        const rect = el.getBoundingClientRect();
        const badge = el.querySelector(badgeSel);
        const index = el.getAttribute('data-test-index');
        return {{
            test_id: el.getAttribute('data-testid'),
            test_index: index === null ? null : parseInt(index, 10),
            badge_text: badge ? badge.textContent.trim() : '',
            top: rect.top + window.pageYOffset,
            height: rect.height,
            displayed: !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length),
        }};
    }});
}})()"#,
            sel = js_string(selector),
            badge = js_string(&self.badge_selector),
        );
        let value = self.evaluate(&script).await?;
        serde_json::from_value(value).map_err(|err| SessionError::Script(err.to_string()))
    }

    async fn find_optional(&self, selector: &str) -> SessionResult<Option<ElementHandle>> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return null;
    const rect = el.getBoundingClientRect();
    return {{
        test_id: el.getAttribute('data-testid'),
        test_index: null,
        badge_text: el.textContent.trim(),
        top: rect.top + window.pageYOffset,
        height: rect.height,
        displayed: !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length),
    }};
}})()"#,
            sel = js_string(selector),
        );
        let value = self.evaluate(&script).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| SessionError::Script(err.to_string()))
    }

    async fn click(&self, selector: &str) -> SessionResult<()> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (el) el.click();
    return !!el;
}})()"#,
            sel = js_string(selector),
        );
        let value = self.evaluate(&script).await?;
        if value.as_bool() != Some(true) {
            return Err(SessionError::Script(format!(
                "click target vanished: {selector}"
            )));
        }
        Ok(())
    }

    async fn geometry(&self) -> SessionResult<PageGeometry> {
        let value = self
            .evaluate(
                r#"({
    viewport_height: window.innerHeight,
    page_height: document.body.scrollHeight,
    scroll_top: window.pageYOffset,
})"#,
            )
            .await?;
        serde_json::from_value(value).map_err(|err| SessionError::Script(err.to_string()))
    }

    async fn scroll_to(&self, top: f64) -> SessionResult<()> {
        let script = format!("window.scrollTo({{top: {top}, behavior: 'smooth'}})");
        self.evaluate(&script).await?;
        Ok(())
    }

    async fn scroll_into_view(&self, selector: &str) -> SessionResult<()> {
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({sel});
    if (el) el.scrollIntoView({{behavior: 'smooth', block: 'center'}});
    return !!el;
}})()"#,
            sel = js_string(selector),
        );
        let value = self.evaluate(&script).await?;
        if value.as_bool() != Some(true) {
            return Err(SessionError::Script(format!(
                "scroll target not found: {selector}"
            )));
        }
        Ok(())
    }

    async fn probe_alive(&self) -> bool {
        self.page.evaluate("1").await.is_ok()
    }

    async fn close(&self) -> SessionResult<()> {
        {
            let mut browser = self.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close chromium gracefully");
            }
        }
        if let Some(handle) = self.handler_task.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "chromium handler join error");
            }
        }
        Ok(())
    }
}

/// Embed a selector as a JS string literal, escaping via JSON.
fn js_string(selector: &str) -> String {
    serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
}
