use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::parse::CouponKind;

/// Identifiers accepted so far in one collection run. Grows monotonically;
/// a run never forgets an id, so replaying an iteration cannot double-count.
#[derive(Debug, Default)]
pub struct DedupTracker {
    seen: HashSet<String>,
}

impl DedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the id was not seen before.
    pub fn insert(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CategoryStats {
    pub count: u64,
    pub avg_value: f64,
}

/// Running counters for one collection run. `total_seen` only moves through
/// `record_seen`/`record_duplicate`, so `total_seen == unique + duplicate`
/// holds structurally.
#[derive(Debug, Clone)]
pub struct CrawlStats {
    pub started_at: DateTime<Utc>,
    pub total_seen: u64,
    pub unique_count: u64,
    pub duplicate_count: u64,
    pub last_index: i64,
    coupon_stats: BTreeMap<CouponKind, CategoryStats>,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            total_seen: 0,
            unique_count: 0,
            duplicate_count: 0,
            last_index: -1,
            coupon_stats: BTreeMap::new(),
        }
    }

    pub fn record_seen(&mut self, index: i64) {
        self.total_seen += 1;
        self.unique_count += 1;
        if index > self.last_index {
            self.last_index = index;
        }
    }

    pub fn record_duplicate(&mut self) {
        self.total_seen += 1;
        self.duplicate_count += 1;
    }

    /// Fold one value into the running mean for its category. O(1), no
    /// value history is kept.
    pub fn update_category_average(&mut self, kind: CouponKind, value: f64) {
        let stats = self.coupon_stats.entry(kind).or_default();
        let count = stats.count as f64;
        stats.avg_value = (stats.avg_value * count + value) / (count + 1.0);
        stats.count += 1;
    }

    /// Fraction of re-shown items, in `[0, 1]`; `0` for an empty run.
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_seen == 0 {
            0.0
        } else {
            self.duplicate_count as f64 / self.total_seen as f64
        }
    }

    pub fn category(&self, kind: CouponKind) -> Option<CategoryStats> {
        self.coupon_stats.get(&kind).copied()
    }

    pub fn snapshot(&self, duration: Duration) -> CrawlReport {
        CrawlReport {
            started_at: self.started_at,
            duration_secs: duration.as_secs_f64(),
            total_seen: self.total_seen,
            unique_count: self.unique_count,
            duplicate_count: self.duplicate_count,
            duplicate_rate: self.duplicate_rate(),
            coupon_stats: self.coupon_stats.clone(),
        }
    }
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Final stats view handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub total_seen: u64,
    pub unique_count: u64,
    pub duplicate_count: u64,
    pub duplicate_rate: f64,
    pub coupon_stats: BTreeMap<CouponKind, CategoryStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_stay_consistent() {
        let mut stats = CrawlStats::new();
        for i in 0..7 {
            stats.record_seen(i);
        }
        for _ in 0..3 {
            stats.record_duplicate();
        }
        assert_eq!(stats.total_seen, stats.unique_count + stats.duplicate_count);
        assert_eq!(stats.unique_count, 7);
        assert_eq!(stats.duplicate_count, 3);
        assert_eq!(stats.last_index, 6);
    }

    #[test]
    fn duplicate_rate_is_zero_on_empty_run() {
        let stats = CrawlStats::new();
        assert_eq!(stats.duplicate_rate(), 0.0);
    }

    #[test]
    fn duplicate_rate_stays_in_unit_interval() {
        let mut stats = CrawlStats::new();
        stats.record_seen(0);
        stats.record_duplicate();
        stats.record_duplicate();
        let rate = stats.duplicate_rate();
        assert!((0.0..=1.0).contains(&rate));
        assert!((rate - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn incremental_mean_matches_plain_mean() {
        let values = [20.0, 5.5, 33.0, 12.25, 70.0];
        let mut stats = CrawlStats::new();
        for v in values {
            stats.update_category_average(CouponKind::Percentage, v);
        }
        let expected: f64 = values.iter().sum::<f64>() / values.len() as f64;
        let category = stats.category(CouponKind::Percentage).unwrap();
        assert_eq!(category.count, values.len() as u64);
        assert!((category.avg_value - expected).abs() < 1e-9);
    }

    #[test]
    fn categories_average_independently(){
        let mut stats = CrawlStats::new();
        stats.update_category_average(CouponKind::Percentage, 10.0);
        stats.update_category_average(CouponKind::Fixed, 30.0);
        stats.update_category_average(CouponKind::Fixed, 50.0);
        assert_eq!(stats.category(CouponKind::Percentage).unwrap().avg_value, 10.0);
        assert_eq!(stats.category(CouponKind::Fixed).unwrap().avg_value, 40.0);
    }

    #[test]
    fn dedup_replay_is_idempotent() {
        let mut tracker = DedupTracker::new();
        assert!(tracker.insert("B0EXAMPLE1"));
        assert!(!tracker.insert("B0EXAMPLE1"));
        assert!(!tracker.insert("B0EXAMPLE1"));
        assert_eq!(tracker.len(), 1);
    }
}
