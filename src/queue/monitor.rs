//! Observable queue status for UI layers.
//!
//! The queue has no change notifications of its own, so the monitor polls it
//! on a fixed tick and also wakes on every connectivity change. Coming back
//! online triggers a drain.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{DrainOutcome, OfflineQueue};
use crate::connectivity::{Connectivity, NetworkStatus};

/// Snapshot published by the monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
  pub online: bool,
  pub pending: usize,
  pub syncing: bool,
  /// Result of the most recent drain that changed anything
  pub last_sync: Option<DrainOutcome>,
}

pub struct QueueMonitor {
  queue: OfflineQueue,
  status_rx: watch::Receiver<QueueStatus>,
  status_tx: Arc<watch::Sender<QueueStatus>>,
  handle: JoinHandle<()>,
}

impl QueueMonitor {
  /// Start monitoring `queue` on the current runtime.
  pub fn spawn(queue: OfflineQueue, connectivity: Connectivity, poll_interval: Duration) -> Self {
    // Subscribe before spawning so a change made right after this returns is
    // still seen as a transition by the task
    let network_rx = connectivity.subscribe();
    let network = *network_rx.borrow();
    let initial = QueueStatus {
      online: network.is_online(),
      pending: queue.len(),
      syncing: queue.is_syncing(),
      last_sync: None,
    };
    let (status_tx, status_rx) = watch::channel(initial);
    let status_tx = Arc::new(status_tx);

    let handle = tokio::spawn(run(
      queue.clone(),
      connectivity,
      network_rx,
      network,
      poll_interval,
      status_tx.clone(),
    ));

    Self {
      queue,
      status_rx,
      status_tx,
      handle,
    }
  }

  /// Latest published status
  pub fn status(&self) -> QueueStatus {
    *self.status_rx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
    self.status_rx.clone()
  }

  /// Drain now instead of waiting for a reconnect.
  pub async fn sync_now(&self) -> Option<DrainOutcome> {
    let outcome = self.queue.drain().await;
    publish(&self.status_tx, &self.queue, None, outcome);
    outcome
  }
}

impl Drop for QueueMonitor {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

async fn run(
  queue: OfflineQueue,
  connectivity: Connectivity,
  mut network_rx: watch::Receiver<NetworkStatus>,
  mut last: NetworkStatus,
  poll_interval: Duration,
  status_tx: Arc<watch::Sender<QueueStatus>>,
) {
  let mut ticker = tokio::time::interval(poll_interval);

  loop {
    tokio::select! {
      _ = ticker.tick() => {
        publish(&status_tx, &queue, Some(connectivity.status()), None);
      }
      changed = network_rx.changed() => {
        if changed.is_err() {
          break;
        }
        let status = *network_rx.borrow_and_update();
        publish(&status_tx, &queue, Some(status), None);

        if last == NetworkStatus::Offline && status == NetworkStatus::Online {
          info!(pending = queue.len(), "back online, syncing queued actions");
          let outcome = queue.drain().await;
          publish(&status_tx, &queue, None, outcome);
        }
        last = status;
      }
    }
  }

  debug!("queue monitor stopped");
}

/// Refresh the published status. Only wakes subscribers on an actual change.
fn publish(
  tx: &watch::Sender<QueueStatus>,
  queue: &OfflineQueue,
  network: Option<NetworkStatus>,
  outcome: Option<DrainOutcome>,
) {
  tx.send_if_modified(|status| {
    let next = QueueStatus {
      online: network.map(NetworkStatus::is_online).unwrap_or(status.online),
      pending: queue.len(),
      syncing: queue.is_syncing(),
      last_sync: outcome.or(status.last_sync),
    };
    if next == *status {
      false
    } else {
      *status = next;
      true
    }
  });
}
