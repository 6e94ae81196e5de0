//! Quota-aware persistent key-value store.
//!
//! Wraps a capacity-limited backend and keeps it usable under pressure:
//! - Every key is classified into an eviction tier by prefix
//! - Writes that would exceed the hard limit evict lower-value records first
//! - Rejected writes walk a retry ladder instead of surfacing an error
//! - A periodic sweep keeps headroom available between writes

mod backend;
mod priority;
mod quota;

pub use backend::{record_size, KeyValueBackend, MemoryBackend, SqliteBackend};
pub use priority::{classify, Tier};
pub use quota::{
  embedded_timestamp, plan_emergency, plan_eviction, QuotaPolicy, QuotaState, StorageRecord,
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SerializationError;

/// Usage statistics for the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
  pub total_size: usize,
  pub item_count: usize,
  pub items: Vec<ItemStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemStats {
  pub key: String,
  pub size: usize,
  pub tier: Tier,
}

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
  /// Keys removed, in removal order
  pub removed: Vec<String>,
  pub freed: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum WriteOutcome {
  Stored,
  /// Not attempted, the write would eat into the safety margin
  Headroom,
  /// Rejected by the backend for lack of space
  Capacity,
  Failed,
}

/// Persistent store that evicts by priority tier when space runs out.
///
/// Writes never return an error: a write that cannot be made to fit reports
/// `false` and callers carry on without the persisted state.
pub struct QuotaStore<B: KeyValueBackend> {
  backend: Arc<B>,
  policy: QuotaPolicy,
}

impl<B: KeyValueBackend> QuotaStore<B> {
  pub fn new(backend: B, policy: QuotaPolicy) -> Self {
    Self {
      backend: Arc::new(backend),
      policy,
    }
  }

  pub fn policy(&self) -> &QuotaPolicy {
    &self.policy
  }

  /// Persist `value` under `key`, evicting other records if needed.
  ///
  /// 1. Over the hard limit - evict down to `hard_limit - size - margin`
  /// 2. Backend rejects the write - evict to the aggressive ratio, retry
  /// 3. Still rejected - remove a small batch of low-value keys, retry
  /// 4. Still rejected - give up and return `false`
  pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
    let serialized = match serde_json::to_string(value) {
      Ok(s) => s,
      Err(e) => {
        let err = SerializationError::from(e);
        error!(key, error = %err, "failed to serialize value");
        return false;
      }
    };
    self.set_raw(key, &serialized)
  }

  /// Persist a JSON object with a `timestamp` field set to now.
  ///
  /// Stamped records take part in age ordering and the grace window.
  pub fn set_stamped<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
    let mut value = match serde_json::to_value(value) {
      Ok(v) => v,
      Err(e) => {
        let err = SerializationError::from(e);
        error!(key, error = %err, "failed to serialize value");
        return false;
      }
    };
    match value.as_object_mut() {
      Some(object) => {
        object.insert("timestamp".to_string(), Value::from(now_ms()));
      }
      None => debug!(key, "value is not an object, storing without timestamp"),
    }
    self.set(key, &value)
  }

  fn set_raw(&self, key: &str, serialized: &str) -> bool {
    let size = record_size(key, serialized);
    let hard_limit = self.policy.hard_limit;
    let over_limit = self.projected(key, size) > hard_limit;

    if over_limit {
      warn!(key, size, "approaching storage quota, evicting before write");
      self.evict_to(self.policy.proactive_target(size));
    }

    // A write that started over the limit must leave the safety margin free
    let headroom = over_limit.then(|| hard_limit.saturating_sub(self.policy.safety_margin));
    let mut blocked = None;
    for attempt in 0..3 {
      if let Some(reason) = blocked {
        if attempt == 1 {
          warn!(key, reason, "evicting aggressively");
          self.evict_to(self.policy.fraction(self.policy.aggressive_ratio));
        } else {
          warn!(key, reason, "emergency eviction");
          self.emergency_evict();
        }
      }

      match self.attempt_write(key, serialized, size, headroom) {
        WriteOutcome::Stored => {
          if attempt > 0 {
            info!(key, attempt, "stored after eviction");
          }
          return true;
        }
        WriteOutcome::Headroom => blocked = Some("write still exceeds headroom"),
        WriteOutcome::Capacity => blocked = Some("storage quota exceeded"),
        WriteOutcome::Failed => return false,
      }
    }

    error!(key, size, reason = blocked, "failed to store value after eviction");
    false
  }

  /// Write unless the result would exceed `headroom`.
  fn attempt_write(
    &self,
    key: &str,
    serialized: &str,
    size: usize,
    headroom: Option<usize>,
  ) -> WriteOutcome {
    match headroom {
      Some(limit) if self.projected(key, size) > limit => WriteOutcome::Headroom,
      _ => self.try_write(key, serialized),
    }
  }

  fn try_write(&self, key: &str, serialized: &str) -> WriteOutcome {
    match self.backend.set(key, serialized) {
      Ok(()) => WriteOutcome::Stored,
      Err(e) if e.is_capacity() => {
        debug!(key, error = %e, "backend rejected write");
        WriteOutcome::Capacity
      }
      Err(e) => {
        error!(key, error = %e, "error writing value");
        WriteOutcome::Failed
      }
    }
  }

  /// Usage after replacing `key` with a record of `size` bytes.
  fn projected(&self, key: &str, size: usize) -> usize {
    let existing: usize = self
      .entries()
      .iter()
      .filter(|(k, _)| k == key)
      .map(|(k, v)| record_size(k, v))
      .sum();
    self.used_bytes().saturating_sub(existing) + size
  }

  /// Read `key`, falling back to `default` when missing or undecodable.
  pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
    let Some(value) = self.get_value(key) else {
      return default;
    };
    match serde_json::from_value(value) {
      Ok(v) => v,
      Err(e) => {
        let err = SerializationError::from(e);
        warn!(key, error = %err, "stored value has unexpected shape, using default");
        default
      }
    }
  }

  /// Read `key` as JSON.
  ///
  /// Values that are not valid JSON predate structured storage and are
  /// returned as a plain string.
  pub fn get_value(&self, key: &str) -> Option<Value> {
    match self.backend.get(key) {
      Ok(Some(raw)) => {
        Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
      }
      Ok(None) => None,
      Err(e) => {
        error!(key, error = %e, "error reading value");
        None
      }
    }
  }

  pub fn remove(&self, key: &str) -> bool {
    match self.backend.remove(key) {
      Ok(()) => true,
      Err(e) => {
        error!(key, error = %e, "error removing value");
        false
      }
    }
  }

  pub fn stats(&self) -> StorageStats {
    let items: Vec<ItemStats> = self
      .entries()
      .iter()
      .map(|(key, value)| ItemStats {
        key: key.clone(),
        size: record_size(key, value),
        tier: classify(key),
      })
      .collect();

    StorageStats {
      total_size: items.iter().map(|i| i.size).sum(),
      item_count: items.len(),
      items,
    }
  }

  pub fn quota(&self) -> QuotaState {
    QuotaState {
      used: self.used_bytes(),
      hard_limit: self.policy.hard_limit,
      soft_threshold: self.policy.fraction(self.policy.sweep_threshold),
    }
  }

  pub fn used_bytes(&self) -> usize {
    self.entries().iter().map(|(k, v)| record_size(k, v)).sum()
  }

  fn entries(&self) -> Vec<(String, String)> {
    self.backend.entries().unwrap_or_else(|e| {
      error!(error = %e, "error enumerating stored keys");
      Vec::new()
    })
  }

  fn records(&self) -> Vec<StorageRecord> {
    let now = now_ms();
    self
      .entries()
      .iter()
      .map(|(key, value)| StorageRecord::new(key, value, now))
      .collect()
  }

  /// Evict records until usage is at most `target` bytes.
  pub fn evict_to(&self, target: usize) -> EvictionReport {
    let records = self.records();
    let used: usize = records.iter().map(|r| r.size).sum();
    if used < target {
      debug!(used, target, "no eviction needed");
      return EvictionReport::default();
    }

    let plan = plan_eviction(records, used, target, &self.policy, now_ms());
    let mut report = EvictionReport::default();
    for record in plan {
      if self.remove_logged(&record.key, record.tier) {
        report.freed += record.size;
        report.removed.push(record.key);
      }
    }

    info!(
      removed = report.removed.len(),
      freed_kb = report.freed / 1024,
      "eviction complete"
    );
    report
  }

  /// Remove a fixed batch of low-value keys regardless of age.
  pub fn emergency_evict(&self) -> EvictionReport {
    let records = self.records();
    let mut report = EvictionReport::default();
    for key in plan_emergency(&records, &self.policy) {
      let Some(record) = records.iter().find(|r| r.key == key) else {
        continue;
      };
      if self.remove_logged(&key, record.tier) {
        report.freed += record.size;
        report.removed.push(key);
      }
    }
    report
  }

  fn remove_logged(&self, key: &str, tier: Tier) -> bool {
    match self.backend.remove(key) {
      Ok(()) => {
        debug!(key, %tier, "evicted");
        true
      }
      Err(e) => {
        warn!(key, error = %e, "failed to evict");
        false
      }
    }
  }

  /// Evict to the sweep target when usage is above the sweep threshold.
  pub fn sweep(&self) -> Option<EvictionReport> {
    self.cleanup_above(self.policy.sweep_threshold, self.policy.sweep_target)
  }

  /// One-off cleanup at process start.
  pub fn startup_cleanup(&self) -> Option<EvictionReport> {
    self.cleanup_above(self.policy.startup_threshold, self.policy.startup_target)
  }

  fn cleanup_above(&self, threshold: f64, target: f64) -> Option<EvictionReport> {
    let used = self.used_bytes();
    if used <= self.policy.fraction(threshold) {
      return None;
    }
    info!(used_kb = used / 1024, "storage above threshold, cleaning up");
    Some(self.evict_to(self.policy.fraction(target)))
  }

  /// Remove everything except critical records and the grace key.
  pub fn clear_non_essential(&self) -> usize {
    let mut removed = 0;
    for record in self.records() {
      if record.tier.is_protected() || record.key == self.policy.grace_key {
        continue;
      }
      if self.remove_logged(&record.key, record.tier) {
        removed += 1;
      }
    }
    removed
  }
}

impl<B: KeyValueBackend + 'static> QuotaStore<B> {
  /// Run [`sweep`](Self::sweep) every `interval` on a background task.
  pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
    let store = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if let Some(report) = store.sweep() {
          info!(removed = report.removed.len(), "periodic sweep freed space");
        }
      }
    })
  }
}

impl<B: KeyValueBackend> Clone for QuotaStore<B> {
  fn clone(&self) -> Self {
    Self {
      backend: Arc::clone(&self.backend),
      policy: self.policy.clone(),
    }
  }
}

fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}
