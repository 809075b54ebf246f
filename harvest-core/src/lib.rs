pub mod collect;
pub mod config;
pub mod error;
pub mod session;

pub use collect::{
    CancelToken, CategoryStats, CollectionRun, CollectionStateMachine, Coupon, CouponKind,
    CouponParser, CrawlReport, CrawlStats, DealRecord, DedupTracker, RunOutcome,
};
pub use config::{
    load_crawler_config, ChromiumSection, CollectionSection, CrawlerConfig, FlagsSection,
    MonitorSection, PageSection, PoolSection,
};
pub use error::{ConfigError, Result};
pub use session::{
    AffinityToken, BrowserSession, ChromiumSessionFactory, ElementHandle, HealthMonitor,
    HostProbe, HostSample, PageGeometry, PoolStats, SessionError, SessionFactory, SessionLease,
    SessionPool, SessionResult, SysinfoProbe,
};
