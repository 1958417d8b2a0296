//! Offline write queue.
//!
//! Writes attempted while offline (or that failed transiently) are appended to
//! a FIFO queue that is mirrored to local storage after every mutation and
//! replayed when connectivity returns:
//! - A drain cycle runs head to tail and is single-flight
//! - A failing action is moved to the tail and the cycle stops there
//! - An action is dropped after 3 failed replays or once it is older than 24h

mod action;
mod handler;
mod monitor;

pub use action::{ActionKind, QueuedAction, RetryPolicy};
pub use handler::{ActionHandler, ActionRegistry, Operation};
pub use monitor::{QueueMonitor, QueueStatus};

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::db::LocalStorage;

/// Local storage key holding the persisted queue
pub const STORAGE_KEY: &str = "offline-queue";

/// Counts from one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
  pub success: usize,
  pub failed: usize,
}

/// Offline action queue. Clones share the same queue.
#[derive(Clone)]
pub struct OfflineQueue {
  inner: Arc<QueueInner>,
}

struct QueueInner {
  actions: Mutex<VecDeque<QueuedAction>>,
  /// Operations attached at enqueue time; gone after a restart
  operations: Mutex<HashMap<String, Operation>>,
  registry: ActionRegistry,
  storage: Arc<dyn LocalStorage>,
  connectivity: Connectivity,
  policy: RetryPolicy,
  /// Single-flight guard for drain cycles
  syncing: AtomicBool,
}

/// Clears the syncing flag when a drain cycle ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl OfflineQueue {
  /// Create a queue over `storage`, restoring anything persisted there.
  pub fn new(
    storage: Arc<dyn LocalStorage>,
    registry: ActionRegistry,
    connectivity: Connectivity,
    policy: RetryPolicy,
  ) -> Self {
    let actions = load_persisted(storage.as_ref());
    if !actions.is_empty() {
      info!(count = actions.len(), "restored offline queue");
    }

    Self {
      inner: Arc::new(QueueInner {
        actions: Mutex::new(actions),
        operations: Mutex::new(HashMap::new()),
        registry,
        storage,
        connectivity,
        policy,
        syncing: AtomicBool::new(false),
      }),
    }
  }

  /// Queue a write to be replayed by the handler registered for `kind`.
  pub fn enqueue(&self, kind: ActionKind, data: serde_json::Value) -> String {
    self.push(kind, data, None)
  }

  /// Queue a write with its own deferred operation.
  ///
  /// The operation is used while this process lives; after a restart the
  /// action falls back to the registry like any other persisted record.
  pub fn enqueue_with<F, Fut>(&self, kind: ActionKind, operation: F, data: serde_json::Value) -> String
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let deferred: Operation =
      Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(operation()) });
    self.push(kind, data, Some(deferred))
  }

  fn push(&self, kind: ActionKind, data: serde_json::Value, operation: Option<Operation>) -> String {
    let action = QueuedAction::new(kind, data);
    let id = action.id.clone();

    if let Some(operation) = operation {
      if let Ok(mut operations) = self.inner.operations.lock() {
        operations.insert(id.clone(), operation);
      }
    }

    match self.inner.lock_actions() {
      Ok(mut actions) => {
        actions.push_back(action);
        self.inner.persist(&actions);
      }
      Err(e) => warn!(%id, "failed to queue action: {}", e),
    }
    debug!(%id, %kind, "action queued");

    if self.inner.connectivity.is_online() {
      self.spawn_drain();
    }

    id
  }

  /// Start a drain cycle in the background if a runtime is available.
  fn spawn_drain(&self) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      let queue = self.clone();
      handle.spawn(async move {
        queue.drain().await;
      });
    }
  }

  /// Replay queued actions in order.
  ///
  /// Returns `None` without doing anything when a cycle is already running,
  /// when offline, or when the queue is empty. Otherwise returns the counts
  /// if at least one action succeeded or was dropped.
  pub async fn drain(&self) -> Option<DrainOutcome> {
    if self.inner.syncing.swap(true, Ordering::SeqCst) {
      return None;
    }
    let _guard = SyncingGuard(&self.inner.syncing);

    if !self.inner.connectivity.is_online() || self.is_empty() {
      return None;
    }

    let mut outcome = DrainOutcome::default();

    loop {
      let Some(head) = self.inner.front() else {
        break;
      };

      match self.inner.replay(&head).await {
        Ok(()) => {
          self.inner.remove(&head.id);
          outcome.success += 1;
          debug!(id = %head.id, "queued action synced");
        }
        Err(e) => {
          if self.inner.record_failure(&head.id) {
            outcome.failed += 1;
            warn!(id = %head.id, "dropping queued action: {}", e);
          } else {
            debug!(id = %head.id, "queued action failed, deferring: {}", e);
            break;
          }
        }
      }
    }

    if outcome.success + outcome.failed > 0 {
      info!(
        success = outcome.success,
        failed = outcome.failed,
        "offline queue drained"
      );
      Some(outcome)
    } else {
      None
    }
  }

  /// Number of pending actions
  pub fn len(&self) -> usize {
    self.inner.lock_actions().map(|a| a.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_syncing(&self) -> bool {
    self.inner.syncing.load(Ordering::SeqCst)
  }

  /// Copy of the pending records, head first.
  pub fn snapshot(&self) -> Vec<QueuedAction> {
    self
      .inner
      .lock_actions()
      .map(|a| a.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Drop every pending action.
  pub fn clear(&self) {
    if let Ok(mut operations) = self.inner.operations.lock() {
      operations.clear();
    }
    match self.inner.lock_actions() {
      Ok(mut actions) => {
        let dropped = actions.len();
        actions.clear();
        self.inner.persist(&actions);
        info!(dropped, "offline queue cleared");
      }
      Err(e) => warn!("failed to clear offline queue: {}", e),
    }
  }

  #[cfg(test)]
  pub(crate) fn connectivity(&self) -> &Connectivity {
    &self.inner.connectivity
  }
}

impl QueueInner {
  fn lock_actions(&self) -> Result<MutexGuard<'_, VecDeque<QueuedAction>>> {
    self
      .actions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn front(&self) -> Option<QueuedAction> {
    match self.lock_actions() {
      Ok(actions) => actions.front().cloned(),
      Err(e) => {
        warn!("failed to read offline queue: {}", e);
        None
      }
    }
  }

  /// Build the replay future for an action. Locks are released before the
  /// caller awaits it.
  fn replay(&self, action: &QueuedAction) -> BoxFuture<'static, Result<()>> {
    let attached = self
      .operations
      .lock()
      .ok()
      .and_then(|ops| ops.get(&action.id).cloned());

    match attached {
      Some(operation) => operation(),
      None => match self.registry.get(action.kind) {
        Some(handler) => handler.replay(action),
        None => {
          let kind = action.kind;
          Box::pin(async move { Err(eyre!("No handler registered for {} actions", kind)) })
        }
      },
    }
  }

  /// Remove a finished action and persist.
  fn remove(&self, id: &str) {
    if let Ok(mut operations) = self.operations.lock() {
      operations.remove(id);
    }
    match self.lock_actions() {
      Ok(mut actions) => {
        actions.retain(|a| a.id != id);
        self.persist(&actions);
      }
      Err(e) => warn!(%id, "failed to remove queued action: {}", e),
    }
  }

  /// Count a failed replay. Returns true if the action was dropped, false if
  /// it was moved to the tail for a later cycle.
  fn record_failure(&self, id: &str) -> bool {
    let mut actions = match self.lock_actions() {
      Ok(actions) => actions,
      Err(e) => {
        warn!(%id, "failed to update queued action: {}", e);
        return false;
      }
    };

    // Cleared while the operation was in flight
    let Some(position) = actions.iter().position(|a| a.id == id) else {
      return false;
    };
    let Some(mut action) = actions.remove(position) else {
      return false;
    };
    action.retries += 1;

    let exhausted = self.policy.is_exhausted(&action, Utc::now());
    if exhausted {
      if let Ok(mut operations) = self.operations.lock() {
        operations.remove(id);
      }
    } else {
      actions.push_back(action);
    }
    self.persist(&actions);
    exhausted
  }

  /// Rewrite the persisted queue in full.
  fn persist(&self, actions: &VecDeque<QueuedAction>) {
    let result = serde_json::to_string(actions)
      .map_err(|e| eyre!("Failed to serialize offline queue: {}", e))
      .and_then(|json| self.storage.set_item(STORAGE_KEY, &json));

    if let Err(e) = result {
      warn!("failed to persist offline queue: {}", e);
    }
  }
}

fn load_persisted(storage: &dyn LocalStorage) -> VecDeque<QueuedAction> {
  let json = match storage.get_item(STORAGE_KEY) {
    Ok(Some(json)) => json,
    Ok(None) => return VecDeque::new(),
    Err(e) => {
      warn!("failed to read persisted offline queue: {}", e);
      return VecDeque::new();
    }
  };

  match serde_json::from_str(&json) {
    Ok(actions) => actions,
    Err(e) => {
      warn!("discarding unreadable offline queue: {}", e);
      VecDeque::new()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::NetworkStatus;
  use crate::db::MemoryLocalStorage;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  fn offline_queue(storage: Arc<dyn LocalStorage>, registry: ActionRegistry) -> OfflineQueue {
    OfflineQueue::new(
      storage,
      registry,
      Connectivity::new(NetworkStatus::Offline),
      RetryPolicy::default(),
    )
  }

  fn kinds_in_order(queue: &OfflineQueue) -> Vec<serde_json::Value> {
    queue.snapshot().into_iter().map(|a| a.data["name"].clone()).collect()
  }

  /// Operation that fails its first `failures` calls, then succeeds.
  fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl Fn() -> BoxFuture<'static, Result<()>> + Send + Sync {
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async move {
        if n < failures {
          Err(eyre!("network down"))
        } else {
          Ok(())
        }
      })
    }
  }

  #[tokio::test]
  async fn test_offline_enqueue_does_not_drain() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = offline_queue(storage, ActionRegistry::new());
    let calls = Arc::new(AtomicU32::new(0));

    let id = queue.enqueue_with(ActionKind::Favorite, flaky(0, calls.clone()), json!({}));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(id.starts_with("favorite-"));
    assert_eq!(queue.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(queue.drain().await, None);
  }

  #[tokio::test]
  async fn test_online_enqueue_drains_immediately() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = OfflineQueue::new(
      storage,
      ActionRegistry::new(),
      Connectivity::new(NetworkStatus::Online),
      RetryPolicy::default(),
    );
    let calls = Arc::new(AtomicU32::new(0));

    queue.enqueue_with(ActionKind::Message, flaky(0, calls.clone()), json!({}));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());
    assert!(!queue.is_syncing());
  }

  #[tokio::test]
  async fn test_failed_head_moves_to_tail_and_stops_cycle() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = offline_queue(storage, ActionRegistry::new());
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));
    let c_calls = Arc::new(AtomicU32::new(0));

    queue.enqueue_with(ActionKind::Favorite, flaky(1, a_calls.clone()), json!({"name": "A"}));
    queue.enqueue_with(ActionKind::Message, flaky(0, b_calls.clone()), json!({"name": "B"}));
    queue.enqueue_with(ActionKind::Booking, flaky(0, c_calls.clone()), json!({"name": "C"}));
    queue.connectivity().set(NetworkStatus::Online);

    // Only A was attempted; nothing succeeded or was dropped
    assert_eq!(queue.drain().await, None);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(kinds_in_order(&queue), vec![json!("B"), json!("C"), json!("A")]);
    assert_eq!(queue.snapshot()[2].retries, 1);

    let outcome = queue.drain().await.unwrap();
    assert_eq!(outcome, DrainOutcome { success: 3, failed: 0 });
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_action_dropped_after_three_failures() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = offline_queue(storage, ActionRegistry::new());
    let calls = Arc::new(AtomicU32::new(0));

    queue.enqueue_with(ActionKind::Listing, flaky(u32::MAX, calls.clone()), json!({}));
    queue.connectivity().set(NetworkStatus::Online);

    assert_eq!(queue.drain().await, None);
    assert_eq!(queue.drain().await, None);
    assert_eq!(queue.snapshot()[0].retries, 2);

    let outcome = queue.drain().await.unwrap();
    assert_eq!(outcome, DrainOutcome { success: 0, failed: 1 });
    assert!(queue.is_empty());

    // Never attempted a fourth time
    assert_eq!(queue.drain().await, None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_stale_action_dropped_on_first_failure() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let old = QueuedAction {
      id: "message-1-aaaaaaaaa".to_string(),
      kind: ActionKind::Message,
      data: json!({"name": "old"}),
      timestamp: (Utc::now() - chrono::Duration::hours(25)).timestamp_millis(),
      retries: 0,
    };
    storage
      .set_item(STORAGE_KEY, &serde_json::to_string(&vec![old]).unwrap())
      .unwrap();

    let failing = move |_: &QueuedAction| -> BoxFuture<'static, Result<()>> {
      Box::pin(async { Err(eyre!("offline")) })
    };
    let registry = ActionRegistry::new().with_handler(ActionKind::Message, Arc::new(failing));
    let queue = offline_queue(storage, registry);
    queue.connectivity().set(NetworkStatus::Online);

    let outcome = queue.drain().await.unwrap();
    assert_eq!(outcome, DrainOutcome { success: 0, failed: 1 });
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_exhausted_action_does_not_stop_cycle() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = offline_queue(storage, ActionRegistry::new());
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));

    queue.enqueue_with(ActionKind::Favorite, flaky(u32::MAX, a_calls.clone()), json!({"name": "A"}));
    queue.connectivity().set(NetworkStatus::Online);
    queue.drain().await;
    queue.drain().await;

    queue.enqueue_with(ActionKind::Message, flaky(0, b_calls.clone()), json!({"name": "B"}));
    // Enqueue spawned a drain; let it settle before checking order
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The spawned cycle dropped A on its third failure and went on to B
    assert!(queue.is_empty());
    assert_eq!(a_calls.load(Ordering::SeqCst), 3);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_reload_restores_order_and_replays_through_registry() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    {
      let queue = offline_queue(storage.clone(), ActionRegistry::new());
      queue.enqueue(ActionKind::Favorite, json!({"name": "first"}));
      queue.enqueue(ActionKind::Booking, json!({"name": "second"}));
      queue.enqueue(ActionKind::Favorite, json!({"name": "third"}));
    }

    let replayed = Arc::new(Mutex::new(Vec::new()));
    let log = replayed.clone();
    let handler = move |action: &QueuedAction| -> BoxFuture<'static, Result<()>> {
      log.lock().unwrap().push(action.data["name"].clone());
      Box::pin(async { Ok(()) })
    };
    let handler: Arc<dyn ActionHandler> = Arc::new(handler);
    let registry = ActionRegistry::new()
      .with_handler(ActionKind::Favorite, handler.clone())
      .with_handler(ActionKind::Booking, handler);

    let queue = offline_queue(storage.clone(), registry);
    assert_eq!(
      kinds_in_order(&queue),
      vec![json!("first"), json!("second"), json!("third")]
    );

    queue.connectivity().set(NetworkStatus::Online);
    let outcome = queue.drain().await.unwrap();
    assert_eq!(outcome.success, 3);
    assert_eq!(
      *replayed.lock().unwrap(),
      vec![json!("first"), json!("second"), json!("third")]
    );
    assert_eq!(storage.get_item(STORAGE_KEY).unwrap().as_deref(), Some("[]"));
  }

  #[tokio::test]
  async fn test_missing_handler_counts_as_failure() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = offline_queue(storage, ActionRegistry::new());
    queue.enqueue(ActionKind::Listing, json!({"title": "Injera maker"}));
    queue.connectivity().set(NetworkStatus::Online);

    assert_eq!(queue.drain().await, None);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.snapshot()[0].retries, 1);
  }

  #[tokio::test]
  async fn test_persisted_state_tracks_every_mutation() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = offline_queue(storage.clone(), ActionRegistry::new());
    let calls = Arc::new(AtomicU32::new(0));

    queue.enqueue_with(ActionKind::Favorite, flaky(1, calls.clone()), json!({"name": "A"}));
    queue.enqueue(ActionKind::Message, json!({"name": "B"}));

    let persisted = || -> Vec<QueuedAction> {
      serde_json::from_str(&storage.get_item(STORAGE_KEY).unwrap().unwrap()).unwrap()
    };
    assert_eq!(persisted().len(), 2);

    queue.connectivity().set(NetworkStatus::Online);
    queue.drain().await;
    assert_eq!(persisted(), queue.snapshot());
    assert_eq!(persisted()[1].retries, 1);

    queue.clear();
    assert!(persisted().is_empty());
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_drain_is_single_flight() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    let queue = offline_queue(storage, ActionRegistry::new());
    let slow = || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok::<(), color_eyre::Report>(())
    };
    queue.enqueue_with(ActionKind::Booking, slow, json!({}));
    queue.connectivity().set(NetworkStatus::Online);

    let background = queue.clone();
    let first = tokio::spawn(async move { background.drain().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(queue.is_syncing());
    assert_eq!(queue.drain().await, None);

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.success, 1);
    assert!(!queue.is_syncing());
  }

  #[test]
  fn test_unreadable_storage_starts_empty() {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
    storage.set_item(STORAGE_KEY, "{not json").unwrap();

    let queue = offline_queue(storage, ActionRegistry::new());
    assert!(queue.is_empty());
  }
}
