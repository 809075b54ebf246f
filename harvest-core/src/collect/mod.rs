mod machine;
mod parse;
mod stats;

pub use machine::{CancelToken, CollectionRun, CollectionStateMachine, DealRecord, RunOutcome};
pub use parse::{Coupon, CouponKind, CouponParser};
pub use stats::{CategoryStats, CrawlReport, CrawlStats, DedupTracker};
