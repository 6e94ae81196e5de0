//! Client-side request cache, background prefetch and quota-aware storage
//! for the CRMS data-loading layer.

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod prefetch;
pub mod store;
pub mod transport;

pub use cache::{CacheLayer, Method, Signature};
pub use client::CachedClient;
pub use config::Config;
pub use context::DataLayer;
pub use error::{BackendError, SerializationError, TransportError};
pub use prefetch::{Bundle, PrefetchContext, PrefetchHandle, Prefetcher, Resource, Role};
pub use store::{KeyValueBackend, MemoryBackend, QuotaPolicy, QuotaStore, SqliteBackend, Tier};
pub use transport::{HttpTransport, Transport};
