//! Service worker: lifecycle, fetch interception, messages and push.
//!
//! Lifecycle follows the browser model. Install precaches the app shell and
//! asks to skip waiting; activate deletes every partition that is neither the
//! current precache nor the runtime partition, which is the only way stale
//! caches are collected.

mod push;
mod routing;

pub use push::{Notification, NotificationHost};
pub use routing::{RoutingRules, Strategy};

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, Fetcher, Request, Served};
use crate::config::CacheConfig;
use crate::connectivity::Connectivity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed; this version will never control pages
  Redundant,
}

/// Messages posted from a page to the worker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
}

#[derive(Debug)]
struct Lifecycle {
  state: WorkerState,
  skip_waiting: bool,
  clients_claimed: bool,
}

pub struct ServiceWorker<S: CacheStorage> {
  layer: CacheLayer<S>,
  fetcher: Arc<dyn Fetcher>,
  rules: RoutingRules,
  precache_name: String,
  runtime_name: String,
  precache_urls: Vec<Url>,
  lifecycle: Mutex<Lifecycle>,
}

impl<S: CacheStorage + 'static> ServiceWorker<S> {
  pub fn new(
    config: &CacheConfig,
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    connectivity: Connectivity,
  ) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid cache origin '{}': {}", config.origin, e))?;
    let resolve = |path: &str| {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid cache URL '{}': {}", path, e))
    };

    let precache_urls = config
      .precache_urls
      .iter()
      .map(|path| resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = resolve(&config.offline_page)?;

    Ok(Self {
      layer: CacheLayer::new(
        storage,
        fetcher.clone(),
        connectivity,
        config.runtime_name.clone(),
        offline_page,
      ),
      fetcher,
      rules: RoutingRules::new(origin, config),
      precache_name: config.precache_name.clone(),
      runtime_name: config.runtime_name.clone(),
      precache_urls,
      lifecycle: Mutex::new(Lifecycle {
        state: WorkerState::Parsed,
        skip_waiting: false,
        clients_claimed: false,
      }),
    })
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle().map(|l| l.state).unwrap_or(WorkerState::Redundant)
  }

  pub fn is_skip_waiting(&self) -> bool {
    self.lifecycle().map(|l| l.skip_waiting).unwrap_or(false)
  }

  pub fn clients_claimed(&self) -> bool {
    self.lifecycle().map(|l| l.clients_claimed).unwrap_or(false)
  }

  pub fn storage(&self) -> &Arc<S> {
    self.layer.storage()
  }

  /// Precache the app shell. All URLs must fetch successfully or nothing is
  /// stored and the worker becomes redundant.
  pub async fn install(&self) -> Result<()> {
    self.transition(WorkerState::Parsed, WorkerState::Installing)?;
    info!(partition = %self.precache_name, urls = self.precache_urls.len(), "installing");

    match self.precache().await {
      Ok(()) => {
        self.set_state(WorkerState::Installed);
        self.skip_waiting();
        Ok(())
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        warn!("install failed: {}", e);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<()> {
    let requests: Vec<Request> = self
      .precache_urls
      .iter()
      .map(|url| Request::get(url.clone()))
      .collect();

    let responses = futures::future::try_join_all(requests.iter().map(|request| {
      let url = request.url.clone();
      let fetch = self.fetcher.fetch(request.clone());
      async move {
        let response = fetch.await?;
        if !response.is_ok() {
          return Err(eyre!("Precache of {} returned {}", url, response.status));
        }
        Ok(response)
      }
    }))
    .await?;

    let storage = self.layer.storage();
    storage.open(&self.precache_name)?;
    for (request, response) in requests.iter().zip(&responses) {
      storage.put(&self.precache_name, request, response)?;
    }
    Ok(())
  }

  /// Remove stale partitions and take control of open pages. Returns the
  /// names of the deleted partitions.
  pub async fn activate(&self) -> Result<Vec<String>> {
    self.transition(WorkerState::Installed, WorkerState::Activating)?;

    let storage = self.layer.storage();
    let mut deleted = Vec::new();
    for name in storage.partitions()? {
      if name != self.precache_name && name != self.runtime_name {
        if storage.delete_partition(&name)? {
          info!(partition = %name, "deleted stale cache");
          deleted.push(name);
        }
      }
    }

    if let Ok(mut lifecycle) = self.lifecycle() {
      lifecycle.state = WorkerState::Activated;
      lifecycle.clients_claimed = true;
    }
    info!("activated");
    Ok(deleted)
  }

  /// Activate as soon as installed, without waiting for old pages to close.
  pub fn skip_waiting(&self) {
    if let Ok(mut lifecycle) = self.lifecycle() {
      lifecycle.skip_waiting = true;
    }
    debug!("skip waiting requested");
  }

  /// Handle a message posted by a page. Unknown messages are ignored.
  pub fn handle_message(&self, message: &serde_json::Value) {
    match WorkerMessage::deserialize(message) {
      Ok(WorkerMessage::SkipWaiting) => self.skip_waiting(),
      Err(_) => debug!(%message, "ignoring message"),
    }
  }

  /// Handle an intercepted request.
  ///
  /// `None` means the worker does not respond and the request goes to the
  /// network untouched.
  pub async fn handle_fetch(&self, request: &Request) -> Option<Result<Served>> {
    let strategy = self.rules.route(request)?;
    debug!(url = %request.url, ?strategy, "intercepted");

    let result = match strategy {
      Strategy::NetworkFirst => self.layer.network_first(request).await,
      Strategy::CacheFirst => self.layer.cache_first(request).await,
      Strategy::StaleWhileRevalidate => self.layer.stale_while_revalidate(request).await,
    };
    Some(result)
  }

  /// Show the notification carried by a push message.
  pub fn handle_push(&self, payload: Option<&[u8]>, host: &dyn NotificationHost) -> Result<Notification> {
    let notification = Notification::from_push(payload);
    host.show_notification(&notification)?;
    Ok(notification)
  }

  /// Open the page a clicked notification points to.
  pub fn handle_notification_click(
    &self,
    notification: &Notification,
    host: &dyn NotificationHost,
  ) -> Result<Url> {
    let target = notification.target(&self.rules.origin);
    host.open_window(&target)?;
    Ok(target)
  }

  fn lifecycle(&self) -> Result<std::sync::MutexGuard<'_, Lifecycle>> {
    self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_state(&self, state: WorkerState) {
    if let Ok(mut lifecycle) = self.lifecycle() {
      lifecycle.state = state;
    }
  }

  fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
    let mut lifecycle = self.lifecycle()?;
    if lifecycle.state != from {
      return Err(eyre!(
        "Cannot move worker to {:?} from {:?}",
        to,
        lifecycle.state
      ));
    }
    lifecycle.state = to;
    Ok(())
  }
}
