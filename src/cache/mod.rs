//! Response cache for intercepted requests.
//!
//! This module provides the storage and strategies behind the worker:
//! - Named partitions of request/response pairs (SQLite, or no-op when disabled)
//! - A `Fetcher` seam for the network, with a reqwest implementation
//! - Network-first, cache-first and stale-while-revalidate strategies

mod http;
mod layer;
mod storage;
mod traits;

pub use http::{Destination, HttpFetcher, Request, RequestMode, Response};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedResponse, NoopStorage, SqliteStorage};
pub use traits::{CacheSource, Fetcher, Served};
