//! Registry of pending operations, keyed by request signature.

use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;

use super::signature::Signature;
use crate::error::TransportError;

/// Shared result of an in-flight operation.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Value, TransportError>>>;

/// A registered pending operation.
#[derive(Clone)]
pub struct InFlightHandle {
  pub future: SharedFetch,
  /// Distinguishes this registration from later ones for the same key
  pub generation: u64,
}

/// Maps signatures to their single pending operation.
#[derive(Default)]
pub struct InFlightRegistry {
  handles: HashMap<Signature, InFlightHandle>,
  next_generation: u64,
}

impl InFlightRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &Signature) -> Option<&InFlightHandle> {
    self.handles.get(key)
  }

  /// Reserve a generation id for a handle about to be registered.
  pub fn next_generation(&mut self) -> u64 {
    let generation = self.next_generation;
    self.next_generation += 1;
    generation
  }

  pub fn insert(&mut self, key: Signature, handle: InFlightHandle) {
    self.handles.insert(key, handle);
  }

  /// Whether `generation` is still the registered handle for `key`.
  pub fn is_current(&self, key: &Signature, generation: u64) -> bool {
    self
      .handles
      .get(key)
      .is_some_and(|handle| handle.generation == generation)
  }

  /// Remove the handle for `key` only if it is still `generation`.
  pub fn settle(&mut self, key: &Signature, generation: u64) -> bool {
    if self.is_current(key, generation) {
      self.handles.remove(key);
      true
    } else {
      false
    }
  }

  /// Detach every handle whose signature starts with `prefix`.
  ///
  /// Callers already awaiting a detached operation still receive its result,
  /// but the result is not cached and new callers start a fresh operation.
  pub fn detach_prefix(&mut self, prefix: &str) -> usize {
    let before = self.handles.len();
    self.handles.retain(|key, _| !key.starts_with(prefix));
    before - self.handles.len()
  }

  pub fn clear(&mut self) {
    self.handles.clear();
  }

  pub fn len(&self) -> usize {
    self.handles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handles.is_empty()
  }
}
