//! Single source of truth for online/offline state.
//!
//! The offline queue and the response cache both read this handle instead of
//! tracking connectivity on their own.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
  Online,
  Offline,
}

impl NetworkStatus {
  pub fn is_online(self) -> bool {
    matches!(self, NetworkStatus::Online)
  }
}

/// Cloneable handle to the shared connectivity state.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<NetworkStatus>>,
}

impl Connectivity {
  pub fn new(initial: NetworkStatus) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn status(&self) -> NetworkStatus {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.status().is_online()
  }

  /// Publish a new status. Returns true if it differs from the current one;
  /// subscribers are only woken on a change.
  pub fn set(&self, status: NetworkStatus) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == status {
        false
      } else {
        *current = status;
        true
      }
    });
    if changed {
      info!(?status, "connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
    self.tx.subscribe()
  }

  /// Periodically probe `url` and publish the result.
  pub fn spawn_prober(
    &self,
    client: reqwest::Client,
    url: String,
    interval: Duration,
  ) -> JoinHandle<()> {
    let connectivity = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let status = probe(&client, &url).await;
        debug!(?status, %url, "connectivity probe");
        connectivity.set(status);
      }
    })
  }
}

/// Any HTTP response counts as online; only transport errors mean offline.
pub async fn probe(client: &reqwest::Client, url: &str) -> NetworkStatus {
  match client
    .head(url)
    .timeout(Duration::from_secs(5))
    .send()
    .await
  {
    Ok(_) => NetworkStatus::Online,
    Err(_) => NetworkStatus::Offline,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_reports_changes_only() {
    let connectivity = Connectivity::new(NetworkStatus::Online);
    assert!(connectivity.is_online());

    assert!(!connectivity.set(NetworkStatus::Online));
    assert!(connectivity.set(NetworkStatus::Offline));
    assert!(!connectivity.is_online());
  }

  #[tokio::test]
  async fn test_clones_share_state_and_notify() {
    let connectivity = Connectivity::new(NetworkStatus::Offline);
    let other = connectivity.clone();
    let mut rx = connectivity.subscribe();

    other.set(NetworkStatus::Online);

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), NetworkStatus::Online);
    assert!(connectivity.is_online());
  }

  #[tokio::test]
  async fn test_probe_unreachable_is_offline() {
    let client = reqwest::Client::new();
    // Port 9 (discard) on localhost is closed in test environments
    let status = probe(&client, "http://127.0.0.1:9/").await;
    assert_eq!(status, NetworkStatus::Offline);
  }
}
