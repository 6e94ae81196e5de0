//! Cache layer that deduplicates requests and caches their results.

use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::inflight::{InFlightHandle, InFlightRegistry};
use super::signature::Signature;
use super::ttl::TtlCache;
use crate::error::TransportError;

/// Default freshness window for cached responses
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default cap on cached responses
pub const DEFAULT_MAX_ENTRIES: usize = 100;

struct State {
  entries: TtlCache,
  in_flight: InFlightRegistry,
}

/// Cache layer that sits between callers and the transport.
///
/// Combines a TTL cache with a registry of in-flight operations so that
/// concurrent identical requests share one network call. Cloning is cheap
/// and every clone shares the same state.
pub struct CacheLayer {
  state: Arc<Mutex<State>>,
  /// TTL used by callers that don't pass their own
  default_ttl: Duration,
}

impl CacheLayer {
  /// Create a new cache layer holding at most `max_entries` responses.
  pub fn new(max_entries: usize) -> Self {
    Self {
      state: Arc::new(Mutex::new(State {
        entries: TtlCache::new(max_entries),
        in_flight: InFlightRegistry::new(),
      })),
      default_ttl: DEFAULT_TTL,
    }
  }

  /// Set the default TTL for cached data.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    lock_state(&self.state)
  }

  /// Return a cached value or run `operation` to produce one.
  ///
  /// 1. Fresh cache entry (younger than `ttl`) - return it immediately
  /// 2. Operation already in flight for this signature - join it
  /// 3. Otherwise start `operation`, register it, and cache its success
  ///
  /// Steps 1-3 run under one lock with no suspension point in between, so
  /// two callers can never both start the same operation. Failures reach
  /// every joined caller and are never cached.
  ///
  /// `operation` is called while the layer's lock is held, so it must only
  /// build the future and never call back into this layer.
  pub async fn get_or_fetch<F, Fut>(
    &self,
    signature: &Signature,
    ttl: Duration,
    operation: F,
  ) -> Result<Value, TransportError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, TransportError>> + Send + 'static,
  {
    let pending = {
      let mut state = self.lock();

      if let Some(value) = state.entries.get(signature, ttl) {
        debug!(%signature, "cache hit");
        return Ok(value.clone());
      }

      if let Some(handle) = state.in_flight.get(signature) {
        debug!(%signature, "joining in-flight request");
        handle.future.clone()
      } else {
        debug!(%signature, "cache miss, starting request");
        let generation = state.in_flight.next_generation();
        let shared_state = Arc::clone(&self.state);
        let key = signature.clone();
        let operation = operation();

        let future = async move {
          let result = operation.await;
          let mut state = lock_state(&shared_state);
          // A detached handle (invalidated or cleared) must not repopulate the cache
          if state.in_flight.settle(&key, generation) {
            if let Ok(value) = &result {
              state.entries.insert(key, value.clone());
            }
          }
          result
        }
        .boxed()
        .shared();

        state.in_flight.insert(
          signature.clone(),
          InFlightHandle {
            future: future.clone(),
            generation,
          },
        );
        future
      }
    };

    pending.await
  }

  /// Cached value for `signature` if younger than `ttl`.
  pub fn peek(&self, signature: &Signature, ttl: Duration) -> Option<Value> {
    self.lock().entries.get(signature, ttl).cloned()
  }

  pub fn is_fresh(&self, signature: &Signature, ttl: Duration) -> bool {
    self.lock().entries.get(signature, ttl).is_some()
  }

  /// Drop every cached entry and pending request whose signature starts with
  /// `prefix`.
  ///
  /// Requests already in flight still resolve for their callers but their
  /// results are discarded, so nothing fetched before the invalidation can be
  /// read after it.
  pub fn invalidate(&self, prefix: &str) -> usize {
    let mut state = self.lock();
    let removed = state.entries.remove_prefix(prefix);
    let detached = state.in_flight.detach_prefix(prefix);
    debug!(prefix, removed, detached, "invalidated cache family");
    removed
  }

  /// Drop everything, including pending requests.
  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.in_flight.clear();
    debug!("cache cleared");
  }

  /// Number of stored entries, fresh or stale.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  pub fn in_flight_count(&self) -> usize {
    self.lock().in_flight.len()
  }
}

impl Default for CacheLayer {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_ENTRIES)
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
      default_ttl: self.default_ttl,
    }
  }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}
