//! Quota thresholds and eviction planning.

use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::time::Duration;

use super::backend::record_size;
use super::priority::{classify, Tier};

/// Thresholds governing when and how far the store evicts.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
  /// Size the store tries never to exceed
  pub hard_limit: usize,
  /// Headroom left below the hard limit by the proactive pass
  pub safety_margin: usize,
  /// Fraction of the hard limit targeted after the backend rejects a write
  pub aggressive_ratio: f64,
  /// Keys removed by the emergency pass
  pub emergency_batch: usize,
  /// Lowest tier the emergency pass may remove
  pub emergency_min_tier: Tier,
  /// Usage fraction above which the periodic sweep runs
  pub sweep_threshold: f64,
  /// Usage fraction the periodic sweep evicts down to
  pub sweep_target: f64,
  /// Usage fraction above which startup cleanup runs
  pub startup_threshold: f64,
  /// Usage fraction startup cleanup evicts down to
  pub startup_target: f64,
  /// Key protected from eviction while younger than `grace_window`
  pub grace_key: String,
  pub grace_window: Duration,
}

impl Default for QuotaPolicy {
  fn default() -> Self {
    Self {
      hard_limit: 4 * 1024 * 1024,
      safety_margin: 100 * 1024,
      aggressive_ratio: 0.7,
      emergency_batch: 5,
      emergency_min_tier: Tier::PREFERENCE,
      sweep_threshold: 0.9,
      sweep_target: 0.8,
      startup_threshold: 0.8,
      startup_target: 0.7,
      grace_key: "selectedClass".to_string(),
      grace_window: Duration::from_secs(60 * 60),
    }
  }
}

impl QuotaPolicy {
  /// `ratio` of the hard limit, in bytes.
  pub fn fraction(&self, ratio: f64) -> usize {
    (self.hard_limit as f64 * ratio) as usize
  }

  /// Target for the proactive pass before writing `size` bytes.
  pub fn proactive_target(&self, size: usize) -> usize {
    self
      .hard_limit
      .saturating_sub(size)
      .saturating_sub(self.safety_margin)
  }
}

/// Snapshot of quota usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaState {
  pub used: usize,
  pub hard_limit: usize,
  /// Usage above which the periodic sweep runs
  pub soft_threshold: usize,
}

impl QuotaState {
  pub fn usage_ratio(&self) -> f64 {
    if self.hard_limit == 0 {
      return 1.0;
    }
    self.used as f64 / self.hard_limit as f64
  }
}

/// A stored record as seen by eviction.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRecord {
  pub key: String,
  pub size: usize,
  pub tier: Tier,
  /// Epoch milliseconds, from the value's `timestamp` field or "now"
  pub timestamp_ms: i64,
}

impl StorageRecord {
  pub fn new(key: &str, raw: &str, now_ms: i64) -> Self {
    Self {
      key: key.to_string(),
      size: record_size(key, raw),
      tier: classify(key),
      timestamp_ms: embedded_timestamp(raw).unwrap_or(now_ms),
    }
  }

  pub fn age(&self, now_ms: i64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(self.timestamp_ms).max(0) as u64)
  }
}

/// Read the `timestamp` field of a JSON object value.
///
/// Records without one are treated as brand new, so they are evicted after
/// every timestamped record of the same tier.
pub fn embedded_timestamp(raw: &str) -> Option<i64> {
  let value: Value = serde_json::from_str(raw).ok()?;
  let timestamp = value.as_object()?.get("timestamp")?;
  timestamp
    .as_i64()
    .or_else(|| timestamp.as_f64().map(|t| t as i64))
}

/// Choose which records to remove to free `used - target` bytes.
///
/// Candidates are ordered evict-first tier before keep-longest tier, and
/// oldest before newest within a tier. Tier 0 is never chosen, nor is the
/// grace key while younger than the grace window. Returns the records in
/// removal order.
pub fn plan_eviction(
  mut records: Vec<StorageRecord>,
  used: usize,
  target: usize,
  policy: &QuotaPolicy,
  now_ms: i64,
) -> Vec<StorageRecord> {
  if used <= target {
    return Vec::new();
  }
  let needed = used - target;

  records.sort_by_key(|r| (Reverse(r.tier), r.timestamp_ms));

  let mut freed = 0;
  let mut plan = Vec::new();
  for record in records {
    if record.tier.is_protected() {
      continue;
    }
    if record.key == policy.grace_key && record.age(now_ms) < policy.grace_window {
      continue;
    }

    freed += record.size;
    plan.push(record);
    if freed >= needed {
      break;
    }
  }
  plan
}

/// Choose up to `emergency_batch` removable keys, ignoring age.
pub fn plan_emergency(records: &[StorageRecord], policy: &QuotaPolicy) -> Vec<String> {
  records
    .iter()
    .filter(|r| !r.tier.is_protected() && r.tier >= policy.emergency_min_tier)
    .take(policy.emergency_batch)
    .map(|r| r.key.clone())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  const NOW: i64 = 1_700_000_000_000;
  const HOUR_MS: i64 = 60 * 60 * 1000;

  fn record(key: &str, size: usize, timestamp_ms: i64) -> StorageRecord {
    StorageRecord {
      key: key.to_string(),
      size,
      tier: classify(key),
      timestamp_ms,
    }
  }

  fn keys(plan: &[StorageRecord]) -> Vec<&str> {
    plan.iter().map(|r| r.key.as_str()).collect()
  }

  #[test]
  fn test_embedded_timestamp() {
    assert_eq!(embedded_timestamp(r#"{"timestamp": 42, "x": 1}"#), Some(42));
    assert_eq!(embedded_timestamp(r#"{"timestamp": 42.9}"#), Some(42));
    assert_eq!(embedded_timestamp(r#"{"x": 1}"#), None);
    assert_eq!(embedded_timestamp(r#"[1, 2]"#), None);
    assert_eq!(embedded_timestamp("plain text"), None);
  }

  #[test]
  fn test_untimestamped_record_is_youngest() {
    let r = StorageRecord::new("cache_x", "\"raw\"", NOW);
    assert_eq!(r.timestamp_ms, NOW);
    assert_eq!(r.age(NOW), Duration::ZERO);
  }

  #[test]
  fn test_removal_order_by_tier_then_age() {
    let records = vec![
      record("theme", 10, NOW - 5 * HOUR_MS),                 // tier 5
      record("cache_new", 10, NOW - HOUR_MS),                 // tier 10
      record("userMgmtActiveTab", 10, NOW - 9 * HOUR_MS),     // tier 3
      record("cache_old", 10, NOW - 3 * HOUR_MS),             // tier 10
      record("dean_dashboard_stats", 10, NOW - 9 * HOUR_MS),  // tier 2
    ];

    let plan = plan_eviction(records, 100, 0, &QuotaPolicy::default(), NOW);
    assert_eq!(
      keys(&plan),
      vec![
        "cache_old",
        "cache_new",
        "theme",
        "userMgmtActiveTab",
        "dean_dashboard_stats"
      ]
    );
  }

  #[test]
  fn test_stops_once_enough_is_freed() {
    let records = vec![
      record("cache_a", 30, NOW - 2),
      record("cache_b", 30, NOW - 1),
      record("theme", 30, NOW),
    ];
    let plan = plan_eviction(records, 90, 40, &QuotaPolicy::default(), NOW);
    assert_eq!(keys(&plan), vec!["cache_a", "cache_b"]);
  }

  #[test]
  fn test_nothing_planned_under_target() {
    let records = vec![record("cache_a", 30, NOW)];
    assert!(plan_eviction(records, 30, 30, &QuotaPolicy::default(), NOW).is_empty());
  }

  #[test]
  fn test_critical_never_planned() {
    let records = vec![
      record("authToken", 1000, 0),
      record("userData", 1000, 0),
      record("cache_a", 10, NOW),
    ];
    let plan = plan_eviction(records, 2010, 0, &QuotaPolicy::default(), NOW);
    assert_eq!(keys(&plan), vec!["cache_a"]);
  }

  #[test]
  fn test_grace_window_protects_recent_selection() {
    let policy = QuotaPolicy::default();

    let recent = vec![record("selectedClass", 10, NOW - HOUR_MS / 2)];
    assert!(plan_eviction(recent, 10, 0, &policy, NOW).is_empty());

    let stale = vec![record("selectedClass", 10, NOW - 2 * HOUR_MS)];
    assert_eq!(keys(&plan_eviction(stale, 10, 0, &policy, NOW)), vec!["selectedClass"]);
  }

  #[test]
  fn test_emergency_ignores_age_and_low_tiers() {
    let policy = QuotaPolicy {
      emergency_batch: 2,
      ..QuotaPolicy::default()
    };
    let records = vec![
      record("authToken", 10, NOW),
      record("dean_dashboard_stats", 10, 0),
      record("theme", 10, NOW),
      record("userMgmtActiveTab", 10, NOW),
      record("cache_a", 10, 0),
    ];
    assert_eq!(plan_emergency(&records, &policy), vec!["theme", "userMgmtActiveTab"]);
  }

  #[test]
  fn test_proactive_target() {
    let policy = QuotaPolicy::default();
    assert_eq!(
      policy.proactive_target(50 * 1024),
      4 * 1024 * 1024 - 150 * 1024
    );
    assert_eq!(policy.fraction(0.7), (4.0 * 1024.0 * 1024.0 * 0.7) as usize);
  }
}
