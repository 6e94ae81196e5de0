//! Transport collaborator: issues requests against the backend API.

mod http;
#[cfg(test)]
pub mod mock;

use serde_json::Value;
use std::future::Future;

pub use http::HttpTransport;

use crate::cache::Method;
use crate::error::TransportError;

/// Something that can execute API requests.
///
/// Rejections carry a status code; a 401 is reported as
/// [`TransportError::Unauthorized`].
pub trait Transport: Send + Sync + 'static {
  /// Execute a request and decode the JSON response.
  fn request(
    &self,
    method: Method,
    path: &str,
    query: &[(String, String)],
    body: Option<&Value>,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send;

  fn get(&self, path: &str) -> impl Future<Output = Result<Value, TransportError>> + Send {
    self.request(Method::Get, path, &[], None)
  }

  fn post(
    &self,
    path: &str,
    body: Option<&Value>,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send {
    self.request(Method::Post, path, &[], body)
  }

  fn put(
    &self,
    path: &str,
    body: Option<&Value>,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send {
    self.request(Method::Put, path, &[], body)
  }

  fn patch(
    &self,
    path: &str,
    body: Option<&Value>,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send {
    self.request(Method::Patch, path, &[], body)
  }

  fn delete(&self, path: &str) -> impl Future<Output = Result<Value, TransportError>> + Send {
    self.request(Method::Delete, path, &[], None)
  }
}
