use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CrawlerConfig {
    pub pool: PoolSection,
    pub monitor: MonitorSection,
    pub collection: CollectionSection,
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub page: PageSection,
}

impl CrawlerConfig {
    /// Contract errors fail here, before any session is launched.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid("pool.max_size must be >= 1".into()));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "pool.min_idle ({}) exceeds pool.max_size ({})",
                self.pool.min_idle, self.pool.max_size
            )));
        }
        if self.pool.acquire_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "pool.acquire_poll_ms must be >= 1".into(),
            ));
        }
        if self.collection.max_items == 0 {
            return Err(ConfigError::Invalid(
                "collection.max_items must be >= 1".into(),
            ));
        }
        let [lo, hi] = self.collection.iteration_delay_ms;
        if lo > hi {
            return Err(ConfigError::Invalid(format!(
                "collection.iteration_delay_ms range is inverted ({lo} > {hi})"
            )));
        }
        if self.page.card_selector.is_empty() || self.page.grid_selector.is_empty() {
            return Err(ConfigError::Invalid(
                "page.card_selector and page.grid_selector are required".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    pub max_size: usize,
    pub min_idle: usize,
    pub max_wait_seconds: u64,
    pub acquire_poll_ms: u64,
}

impl PoolSection {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    pub fn acquire_poll(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    pub check_interval_seconds: u64,
    pub cpu_high_water_percent: f32,
    pub memory_high_water_percent: f32,
}

impl MonitorSection {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSection {
    pub max_items: usize,
    pub stall_timeout_seconds: u64,
    pub max_consecutive_stalls: u32,
    pub max_connection_retries: u32,
    pub iteration_delay_ms: [u64; 2],
    pub retry_settle_seconds: u64,
    pub initial_settle_seconds: u64,
}

impl CollectionSection {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_seconds)
    }

    pub fn retry_settle(&self) -> Duration {
        Duration::from_secs(self.retry_settle_seconds)
    }

    pub fn initial_settle(&self) -> Duration {
        Duration::from_secs(self.initial_settle_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agent: String,
    pub page_load_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_automation_controlled: bool,
    pub disable_blink_features: Vec<String>,
    pub mute_audio: bool,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
}

/// Site-volatile selector strategy. The core treats every field as opaque
/// data; changing the target page means editing the config, not the code.
#[derive(Debug, Clone, Deserialize)]
pub struct PageSection {
    pub listing_url: String,
    pub grid_selector: String,
    pub card_selector: String,
    /// Selector, scoped inside a card, for the value badge to parse.
    pub badge_selector: String,
    /// Selector for the first unprocessed card; `{index}` is substituted.
    pub next_index_selector: String,
    pub retry_selector: String,
    pub load_more_selector: String,
    /// Canonical record url; `{id}` is substituted.
    pub item_url_template: String,
}

impl PageSection {
    pub fn next_index_selector(&self, index: i64) -> String {
        self.next_index_selector
            .replace("{index}", &index.to_string())
    }

    pub fn item_url(&self, id: &str) -> String {
        self.item_url_template.replace("{id}", id)
    }
}

pub fn load_crawler_config<P: AsRef<Path>>(path: P) -> Result<CrawlerConfig> {
    let config: CrawlerConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let config = load_crawler_config(dir.join("crawler.toml")).expect("config should parse");
        assert!(config.pool.min_idle <= config.pool.max_size);
        assert_eq!(config.collection.max_consecutive_stalls, 3);
        assert!(config.page.next_index_selector.contains("{index}"));
    }

    #[test]
    fn min_idle_above_max_size_is_rejected() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let mut config = load_crawler_config(dir.join("crawler.toml")).unwrap();
        config.pool.min_idle = config.pool.max_size + 1;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn inverted_delay_range_is_rejected() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let mut config = load_crawler_config(dir.join("crawler.toml")).unwrap();
        config.collection.iteration_delay_ms = [2500, 1500];
        assert!(config.validate().is_err());
    }

    #[test]
    fn selector_placeholders_substitute() {
        let page = PageSection {
            listing_url: "https://example.com/deals".into(),
            grid_selector: "div.grid".into(),
            card_selector: "div.card".into(),
            badge_selector: "span.badge".into(),
            next_index_selector: "div[data-test-index=\"{index}\"]".into(),
            retry_selector: "input.retry".into(),
            load_more_selector: "button.more".into(),
            item_url_template: "https://example.com/dp/{id}".into(),
        };
        assert_eq!(
            page.next_index_selector(7),
            "div[data-test-index=\"7\"]".to_string()
        );
        assert_eq!(page.item_url("B0TEST"), "https://example.com/dp/B0TEST");
    }
}
