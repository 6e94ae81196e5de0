//! Eviction priority classification for persisted keys.

use serde::Serialize;
use std::fmt;

/// Eviction tier of a persisted key.
///
/// Tier 0 is never evicted; tier 10 is evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Tier(u8);

impl Tier {
  /// Identity and session records
  pub const CRITICAL: Tier = Tier(0);
  /// Current selection
  pub const WORKING_SET: Tier = Tier(1);
  /// Recently computed dashboard state
  pub const RECENT_STATE: Tier = Tier(2);
  /// UI preferences such as active tabs
  pub const PREFERENCE: Tier = Tier(3);
  /// Anything not in the table
  pub const UNCLASSIFIED: Tier = Tier(5);
  /// Bulk derived caches
  pub const BULK: Tier = Tier(10);

  pub const fn new(value: u8) -> Self {
    if value > 10 {
      Tier(10)
    } else {
      Tier(value)
    }
  }

  pub const fn value(self) -> u8 {
    self.0
  }

  /// Whether keys in this tier are exempt from every eviction pass.
  pub fn is_protected(self) -> bool {
    self == Self::CRITICAL
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Key prefixes and their tiers.
const PRIORITY_TABLE: &[(&str, Tier)] = &[
  ("authToken", Tier::CRITICAL),
  ("userData", Tier::CRITICAL),
  ("selectedClass", Tier::WORKING_SET),
  ("dean_dashboard_stats", Tier::RECENT_STATE),
  ("userMgmtActiveTab", Tier::PREFERENCE),
  ("schoolConfigActiveTab", Tier::PREFERENCE),
  ("faculty_classes_", Tier::BULK),
  ("students_", Tier::BULK),
  ("classes_", Tier::BULK),
  ("cache_", Tier::BULK),
];

/// Classify `key` by the longest matching prefix in the priority table.
pub fn classify(key: &str) -> Tier {
  classify_with(PRIORITY_TABLE, key)
}

fn classify_with(table: &[(&str, Tier)], key: &str) -> Tier {
  table
    .iter()
    .filter(|(prefix, _)| key.starts_with(prefix))
    .max_by_key(|(prefix, _)| prefix.len())
    .map(|(_, tier)| *tier)
    .unwrap_or(Tier::UNCLASSIFIED)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exact_keys() {
    assert_eq!(classify("authToken"), Tier::CRITICAL);
    assert_eq!(classify("userData"), Tier::CRITICAL);
    assert_eq!(classify("selectedClass"), Tier::WORKING_SET);
    assert_eq!(classify("dean_dashboard_stats"), Tier::RECENT_STATE);
    assert_eq!(classify("userMgmtActiveTab"), Tier::PREFERENCE);
  }

  #[test]
  fn test_prefix_families() {
    assert_eq!(classify("students_2024"), Tier::BULK);
    assert_eq!(classify("cache_terms"), Tier::BULK);
  }

  #[test]
  fn test_longest_prefix_wins() {
    let table = [
      ("cache_", Tier::BULK),
      ("cache_session_", Tier::CRITICAL),
      ("cache_session_draft", Tier::PREFERENCE),
    ];
    assert_eq!(classify_with(&table, "cache_terms"), Tier::BULK);
    assert_eq!(classify_with(&table, "cache_session_id"), Tier::CRITICAL);
    assert_eq!(classify_with(&table, "cache_session_draft_3"), Tier::PREFERENCE);
    // Table order must not matter
    let mut reversed = table;
    reversed.reverse();
    assert_eq!(classify_with(&reversed, "cache_session_id"), Tier::CRITICAL);
  }

  #[test]
  fn test_prefix_is_anchored() {
    assert_eq!(classify("faculty_classes_7"), Tier::BULK);
    assert_eq!(classify("my_classes_7"), Tier::UNCLASSIFIED);
    assert_eq!(classify("selectedClassBanner"), Tier::WORKING_SET);
  }

  #[test]
  fn test_unmatched_defaults_to_middle() {
    assert_eq!(classify("theme"), Tier::UNCLASSIFIED);
    assert_eq!(classify(""), Tier::UNCLASSIFIED);
  }

  #[test]
  fn test_tier_clamped() {
    assert_eq!(Tier::new(42), Tier::BULK);
    assert!(Tier::CRITICAL.is_protected());
    assert!(!Tier::WORKING_SET.is_protected());
  }
}
