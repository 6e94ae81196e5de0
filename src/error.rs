//! Error types for the cache, transport and persistent store.

use thiserror::Error;

/// Failure of a network operation.
///
/// Propagated unmodified to callers. Must be `Clone` so a single failure can
/// be handed to every caller joined on the same in-flight request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("request failed with status {status}: {message}")]
  Status { status: u16, message: String },

  #[error("unauthorized")]
  Unauthorized,

  #[error("network error: {0}")]
  Network(String),

  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl TransportError {
  /// HTTP status carried by the error, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      Self::Unauthorized => Some(401),
      _ => None,
    }
  }

  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Self::Unauthorized)
  }
}

impl From<reqwest::Error> for TransportError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      Self::Decode(err.to_string())
    } else {
      Self::Network(err.to_string())
    }
  }
}

/// Failure reported by a persistent key-value backend.
#[derive(Debug, Error)]
pub enum BackendError {
  /// The write would exceed the backend's capacity.
  #[error("storage quota exceeded: needed {needed} bytes, {available} available")]
  Capacity { needed: usize, available: usize },

  #[error("storage error: {0}")]
  Storage(String),
}

impl BackendError {
  pub fn is_capacity(&self) -> bool {
    matches!(self, Self::Capacity { .. })
  }
}

impl From<rusqlite::Error> for BackendError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Storage(err.to_string())
  }
}

/// A value could not be encoded or decoded.
#[derive(Debug, Error)]
#[error("serialization error: {0}")]
pub struct SerializationError(#[from] pub serde_json::Error);
