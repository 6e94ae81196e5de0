//! Time-bounded in-memory response cache.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::signature::Signature;

/// A cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: Value,
  pub inserted_at: Instant,
  /// Monotonic insertion order, used to pick victims when over capacity
  seq: u64,
}

impl CacheEntry {
  /// Whether the entry is still readable under `ttl` at `now`.
  pub fn is_live(&self, ttl: Duration, now: Instant) -> bool {
    now.saturating_duration_since(self.inserted_at) < ttl
  }
}

/// Keyed store of (value, insertion time).
///
/// Entries are never deleted on expiry; a stale entry simply stops being
/// returned. The entry count is capped and the oldest insertions are dropped
/// once the cap is exceeded.
#[derive(Debug)]
pub struct TtlCache {
  entries: HashMap<Signature, CacheEntry>,
  max_entries: usize,
  next_seq: u64,
}

impl TtlCache {
  pub fn new(max_entries: usize) -> Self {
    Self {
      entries: HashMap::new(),
      max_entries: max_entries.max(1),
      next_seq: 0,
    }
  }

  /// Return the value for `key` if it was inserted less than `ttl` ago.
  pub fn get(&self, key: &Signature, ttl: Duration) -> Option<&Value> {
    let now = Instant::now();
    self
      .entries
      .get(key)
      .filter(|entry| entry.is_live(ttl, now))
      .map(|entry| &entry.value)
  }

  /// Insert or overwrite `key`, stamped with the current time.
  pub fn insert(&mut self, key: Signature, value: Value) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.entries.insert(
      key,
      CacheEntry {
        value,
        inserted_at: Instant::now(),
        seq,
      },
    );

    while self.entries.len() > self.max_entries {
      let oldest = self
        .entries
        .iter()
        .min_by_key(|(_, entry)| entry.seq)
        .map(|(key, _)| key.clone());
      match oldest {
        Some(key) => {
          tracing::debug!(signature = %key, "dropping oldest cache entry over capacity");
          self.entries.remove(&key);
        }
        None => break,
      }
    }
  }

  /// Remove every entry whose signature starts with `prefix`.
  ///
  /// Returns the number of entries removed.
  pub fn remove_prefix(&mut self, prefix: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|key, _| !key.starts_with(prefix));
    before - self.entries.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  /// Number of stored entries, live or stale.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
