//! API client with transparent caching.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{family_prefix, CacheLayer, Method, Signature};
use crate::error::TransportError;
use crate::transport::Transport;

/// API client with transparent caching support.
///
/// Reads go through the [`CacheLayer`], so repeated and concurrent reads of
/// the same resource share one network call. Mutations go straight to the
/// transport and, on success, invalidate the key families they name.
pub struct CachedClient<T: Transport> {
  inner: Arc<T>,
  cache: CacheLayer,
}

impl<T: Transport> CachedClient<T> {
  pub fn new(transport: T, cache: CacheLayer) -> Self {
    Self {
      inner: Arc::new(transport),
      cache,
    }
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn transport(&self) -> &T {
    &self.inner
  }

  /// GET `path` with caching, using the cache's default TTL.
  pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, TransportError> {
    self.get_with_ttl(path, params, self.cache.default_ttl()).await
  }

  /// GET `path` with caching, treating entries older than `ttl` as stale.
  pub async fn get_with_ttl(
    &self,
    path: &str,
    params: &[(&str, &str)],
    ttl: Duration,
  ) -> Result<Value, TransportError> {
    let signature = Signature::new(Method::Get, path, params, None);
    let result = self
      .cache
      .get_or_fetch(&signature, ttl, || {
        let inner = Arc::clone(&self.inner);
        let path = path.to_string();
        let query = owned_params(params);
        async move { inner.request(Method::Get, &path, &query, None).await }
      })
      .await;

    self.observe(result)
  }

  /// GET `path` with caching and decode the response.
  pub async fn get_as<R: DeserializeOwned>(
    &self,
    path: &str,
    params: &[(&str, &str)],
  ) -> Result<R, TransportError> {
    let value = self.get(path, params).await?;
    serde_json::from_value(value).map_err(|e| TransportError::Decode(e.to_string()))
  }

  /// Whether a GET of `path` would be answered from the cache.
  pub fn is_cached(&self, path: &str, params: &[(&str, &str)]) -> bool {
    self.is_cached_within(path, params, self.cache.default_ttl())
  }

  /// Whether a cached GET of `path` is younger than `ttl`.
  pub fn is_cached_within(&self, path: &str, params: &[(&str, &str)], ttl: Duration) -> bool {
    let signature = Signature::new(Method::Get, path, params, None);
    self.cache.is_fresh(&signature, ttl)
  }

  pub async fn post(
    &self,
    path: &str,
    body: &Value,
    invalidates: &[&str],
  ) -> Result<Value, TransportError> {
    self.mutate(Method::Post, path, Some(body), invalidates).await
  }

  pub async fn put(
    &self,
    path: &str,
    body: &Value,
    invalidates: &[&str],
  ) -> Result<Value, TransportError> {
    self.mutate(Method::Put, path, Some(body), invalidates).await
  }

  pub async fn patch(
    &self,
    path: &str,
    body: &Value,
    invalidates: &[&str],
  ) -> Result<Value, TransportError> {
    self.mutate(Method::Patch, path, Some(body), invalidates).await
  }

  pub async fn delete(&self, path: &str, invalidates: &[&str]) -> Result<Value, TransportError> {
    self.mutate(Method::Delete, path, None, invalidates).await
  }

  /// Issue a mutation (not cached) and invalidate `invalidates` on success.
  ///
  /// Each entry of `invalidates` is a resource path; every cached GET under
  /// it is dropped, with any request parameters.
  pub async fn mutate(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
    invalidates: &[&str],
  ) -> Result<Value, TransportError> {
    let result = self.inner.request(method, path, &[], body).await;
    let value = self.observe(result)?;

    for family in invalidates {
      let prefix = family_prefix(Method::Get, family);
      let removed = self.cache.invalidate(&prefix);
      debug!(%method, path, family = %prefix, removed, "invalidated after mutation");
    }
    Ok(value)
  }

  /// Clear the whole cache when the session is no longer authorized.
  fn observe(&self, result: Result<Value, TransportError>) -> Result<Value, TransportError> {
    if let Err(e) = &result {
      if e.is_unauthorized() {
        warn!("request unauthorized, clearing cache");
        self.cache.clear();
      }
    }
    result
  }
}

impl<T: Transport> Clone for CachedClient<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      cache: self.cache.clone(),
    }
  }
}

fn owned_params(params: &[(&str, &str)]) -> Vec<(String, String)> {
  params
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
