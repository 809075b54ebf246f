mod capability;
mod chromium;
mod error;
mod monitor;
mod pool;

pub use capability::{BrowserSession, ElementHandle, PageGeometry, SessionFactory};
pub use chromium::{ChromiumSession, ChromiumSessionFactory};
pub use error::{SessionError, SessionResult};
pub use monitor::{HealthMonitor, HostProbe, HostSample, SysinfoProbe};
pub use pool::{AffinityToken, PoolStats, SessionLease, SessionPool};
