//! The data layer: one object owning the cache, prefetcher and store.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheLayer, Signature};
use crate::client::CachedClient;
use crate::config::Config;
use crate::error::TransportError;
use crate::prefetch::{PrefetchContext, PrefetchHandle, Prefetcher};
use crate::store::{KeyValueBackend, QuotaState, QuotaStore, SqliteBackend, StorageStats};
use crate::transport::{HttpTransport, Transport};

/// Caller surface of the caching subsystem.
///
/// Created once at process start and handed to whatever needs it. Cloning
/// is cheap and every clone shares the same cache, prefetch state and store.
pub struct DataLayer<T: Transport, B: KeyValueBackend> {
  cache: CacheLayer,
  client: CachedClient<T>,
  prefetcher: Prefetcher<T>,
  store: QuotaStore<B>,
  sweep_interval: Duration,
}

impl DataLayer<HttpTransport, SqliteBackend> {
  /// Build the data layer against the configured API and SQLite store.
  pub fn from_config(config: &Config) -> Result<Self> {
    let transport = HttpTransport::new(&config.api)?;
    let backend = match &config.storage.path {
      Some(path) => SqliteBackend::open_at(path, config.storage.capacity)?,
      None => SqliteBackend::open(config.storage.capacity)?,
    };
    Ok(Self::new(transport, backend, config))
  }
}

impl<T: Transport, B: KeyValueBackend> DataLayer<T, B> {
  /// Assemble the data layer and run the startup cleanup on the store.
  pub fn new(transport: T, backend: B, config: &Config) -> Self {
    let cache = CacheLayer::new(config.cache.max_entries).with_default_ttl(config.cache.ttl());
    let client = CachedClient::new(transport, cache.clone());
    let prefetcher = Prefetcher::new(client.clone(), config.prefetch.delay());
    let store = QuotaStore::new(backend, config.storage.policy());

    if let Some(report) = store.startup_cleanup() {
      info!(
        removed = report.removed.len(),
        freed_kb = report.freed / 1024,
        "startup storage cleanup"
      );
    }

    Self {
      cache,
      client,
      prefetcher,
      store,
      sweep_interval: config.storage.sweep_interval(),
    }
  }

  pub fn client(&self) -> &CachedClient<T> {
    &self.client
  }

  pub fn prefetcher(&self) -> &Prefetcher<T> {
    &self.prefetcher
  }

  pub fn store(&self) -> &QuotaStore<B> {
    &self.store
  }

  /// Cached, deduplicated execution of an arbitrary operation.
  pub async fn get_or_fetch<F, Fut>(
    &self,
    signature: &Signature,
    ttl: Duration,
    operation: F,
  ) -> Result<Value, TransportError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Value, TransportError>> + Send + 'static,
  {
    self.cache.get_or_fetch(signature, ttl, operation).await
  }

  /// Drop cached entries and pending requests under `prefix`.
  pub fn invalidate(&self, prefix: &str) -> usize {
    self.cache.invalidate(prefix)
  }

  pub fn trigger_prefetch(&self, bundle: &str, context: PrefetchContext) -> PrefetchHandle {
    self.prefetcher.trigger_prefetch(bundle, context)
  }

  pub fn schedule_prefetch(&self, bundle: &str, context: PrefetchContext) -> JoinHandle<()> {
    self.prefetcher.schedule_prefetch(bundle, context)
  }

  pub fn set_persisted<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> bool {
    self.store.set(key, value)
  }

  pub fn get_persisted<V: DeserializeOwned>(&self, key: &str, default: V) -> V {
    self.store.get(key, default)
  }

  pub fn remove_persisted(&self, key: &str) -> bool {
    self.store.remove(key)
  }

  pub fn stats(&self) -> StorageStats {
    self.store.stats()
  }

  pub fn quota(&self) -> QuotaState {
    self.store.quota()
  }
}

impl<T: Transport, B: KeyValueBackend + 'static> DataLayer<T, B> {
  /// Start the periodic storage sweep at the configured interval.
  pub fn spawn_sweeper(&self) -> JoinHandle<()> {
    self.store.spawn_sweeper(self.sweep_interval)
  }
}

impl<T: Transport, B: KeyValueBackend> Clone for DataLayer<T, B> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      client: self.client.clone(),
      prefetcher: self.prefetcher.clone(),
      store: self.store.clone(),
      sweep_interval: self.sweep_interval,
    }
  }
}
