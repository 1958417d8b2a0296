//! Core traits and types for the caching system.

use color_eyre::Result;
use futures::future::BoxFuture;

use super::http::{Request, Response};

/// Anything that can perform a network request.
///
/// Futures are `'static` so strategies can run them in background tasks.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>>;
}

impl<F> Fetcher for F
where
  F: Fn(Request) -> BoxFuture<'static, Result<Response>> + Send + Sync,
{
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
    self(request)
  }
}

/// A response handed back to the page, with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
    }
  }

  /// The offline page substituted for a failed navigation.
  pub fn offline_fallback(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::OfflineFallback,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Stored response matching the request
  Cache,
  /// Network failed on a navigation, serving the offline page
  OfflineFallback,
}
