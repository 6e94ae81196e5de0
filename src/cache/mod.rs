//! In-process request cache with deduplication.
//!
//! This module provides the read path used by every network request:
//! - Canonical request signatures so logically identical requests collide
//! - A TTL cache with a bounded entry count
//! - A registry of in-flight operations so concurrent duplicates share one call
//! - Prefix invalidation for mutations that change a family of resources

mod inflight;
mod layer;
mod signature;
mod ttl;

pub use layer::{CacheLayer, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
pub use signature::{family_prefix, normalize_path, Method, Signature};
pub use ttl::{CacheEntry, TtlCache};
