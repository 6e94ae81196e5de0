//! In-memory transport for tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Transport;
use crate::cache::{normalize_path, Method};
use crate::error::TransportError;

/// Transport that answers from a fixed route table and counts calls.
#[derive(Clone, Default)]
pub struct MockTransport {
  routes: Arc<Mutex<HashMap<String, Result<Value, TransportError>>>>,
  calls: Arc<Mutex<HashMap<String, usize>>>,
  total: Arc<AtomicUsize>,
  delay: Duration,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulate network latency on every call.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn route(self, path: &str, response: Value) -> Self {
    self.set_route(path, Ok(response));
    self
  }

  pub fn fail(self, path: &str, error: TransportError) -> Self {
    self.set_route(path, Err(error));
    self
  }

  pub fn set_route(&self, path: &str, response: Result<Value, TransportError>) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(normalize_path(path), response);
  }

  pub fn calls(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .get(&normalize_path(path))
      .copied()
      .unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.total.load(Ordering::SeqCst)
  }
}

impl Transport for MockTransport {
  async fn request(
    &self,
    _method: Method,
    path: &str,
    _query: &[(String, String)],
    _body: Option<&Value>,
  ) -> Result<Value, TransportError> {
    let path = normalize_path(path);
    self.total.fetch_add(1, Ordering::SeqCst);
    *self.calls.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    self
      .routes
      .lock()
      .unwrap()
      .get(&path)
      .cloned()
      .unwrap_or_else(|| {
        Err(TransportError::Status {
          status: 404,
          message: format!("no route for {}", path),
        })
      })
  }
}
