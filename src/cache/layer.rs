//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::http::{Request, Response};
use super::storage::CacheStorage;
use super::traits::{Fetcher, Served};
use crate::connectivity::Connectivity;

/// Cache layer that manages caching logic and network fetching.
///
/// Successful responses are written to the runtime partition; lookups search
/// every partition so precached app-shell entries are served too.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  connectivity: Connectivity,
  runtime_partition: String,
  offline_page: Url,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    connectivity: Connectivity,
    runtime_partition: impl Into<String>,
    offline_page: Url,
  ) -> Self {
    Self {
      storage,
      fetcher,
      connectivity,
      runtime_partition: runtime_partition.into(),
      offline_page,
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Try the network; on success store a copy in the background and return it
  /// 2. On failure, return any cached match
  /// 3. For navigations with no match, return the offline page
  /// 4. Otherwise propagate the network error
  pub async fn network_first(&self, request: &Request) -> Result<Served> {
    match self.network(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_in_background(request.clone(), response.clone());
        }
        Ok(Served::from_network(response))
      }
      Err(err) => {
        if let Some(cached) = self.lookup(request) {
          debug!(url = %request.url, "network failed, serving cached response");
          return Ok(Served::from_cache(cached));
        }

        if request.is_navigation() {
          let offline = Request::get(self.offline_page.clone());
          if let Some(page) = self.lookup(&offline) {
            debug!(url = %request.url, "network failed, serving offline page");
            return Ok(Served::offline_fallback(page));
          }
        }

        Err(err)
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// A cached match is returned without touching the network. On a miss the
  /// network response is stored and returned; network errors propagate.
  pub async fn cache_first(&self, request: &Request) -> Result<Served> {
    if let Some(cached) = self.lookup(request) {
      return Ok(Served::from_cache(cached));
    }

    let response = self.network(request).await?;
    if response.is_ok() {
      self.store(request, &response);
    }
    Ok(Served::from_network(response))
  }

  /// Fetch with stale-while-revalidate strategy.
  ///
  /// The network fetch always starts and refreshes the runtime partition when
  /// it succeeds. A cached match is returned immediately; without one the
  /// caller waits for the network.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<Served> {
    let revalidation = self.revalidate(request.clone());

    if let Some(cached) = self.lookup(request) {
      return Ok(Served::from_cache(cached));
    }

    let response = revalidation
      .await
      .map_err(|e| eyre!("Revalidation of {} did not complete: {}", request.url, e))??;
    Ok(Served::from_network(response))
  }

  /// Network call gated on the shared connectivity state.
  async fn network(&self, request: &Request) -> Result<Response> {
    network(&self.fetcher, &self.connectivity, request.clone()).await
  }

  /// Cache match across partitions. Storage errors count as a miss.
  fn lookup(&self, request: &Request) -> Option<Response> {
    match self.storage.match_any(request) {
      Ok(cached) => cached.map(|c| c.response),
      Err(e) => {
        warn!(url = %request.url, "cache lookup failed: {}", e);
        None
      }
    }
  }

  fn store(&self, request: &Request, response: &Response) {
    store(self.storage.as_ref(), &self.runtime_partition, request, response);
  }

  fn store_in_background(&self, request: Request, response: Response) {
    let storage = self.storage.clone();
    let partition = self.runtime_partition.clone();
    tokio::spawn(async move {
      store(storage.as_ref(), &partition, &request, &response);
    });
  }

  /// Fetch in a background task, storing a successful response.
  fn revalidate(&self, request: Request) -> JoinHandle<Result<Response>> {
    let storage = self.storage.clone();
    let fetcher = self.fetcher.clone();
    let connectivity = self.connectivity.clone();
    let partition = self.runtime_partition.clone();

    tokio::spawn(async move {
      let response = network(&fetcher, &connectivity, request.clone()).await;
      match &response {
        Ok(response) if response.is_ok() => {
          store(storage.as_ref(), &partition, &request, response);
        }
        Ok(response) => debug!(url = %request.url, status = response.status, "not caching"),
        Err(e) => debug!(url = %request.url, "revalidation failed: {}", e),
      }
      response
    })
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      connectivity: self.connectivity.clone(),
      runtime_partition: self.runtime_partition.clone(),
      offline_page: self.offline_page.clone(),
    }
  }
}

async fn network(
  fetcher: &Arc<dyn Fetcher>,
  connectivity: &Connectivity,
  request: Request,
) -> Result<Response> {
  if !connectivity.is_online() {
    return Err(eyre!("Offline, not fetching {}", request.url));
  }
  fetcher.fetch(request).await
}

fn store<S: CacheStorage + ?Sized>(storage: &S, partition: &str, request: &Request, response: &Response) {
  if let Err(e) = storage.put(partition, request, response) {
    warn!(url = %request.url, "failed to cache response: {}", e);
  }
}
