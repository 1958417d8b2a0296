//! Rebuilding deferred operations from persisted queue records.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::action::{ActionKind, QueuedAction};
use crate::config::{BackendConfig, Config};

/// A deferred write held in memory for the life of the process.
pub type Operation = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Replays a persisted action against the backend.
pub trait ActionHandler: Send + Sync {
  fn replay(&self, action: &QueuedAction) -> BoxFuture<'static, Result<()>>;
}

/// Handlers keyed by action kind.
#[derive(Clone, Default)]
pub struct ActionRegistry {
  handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry that posts every kind to its backend table.
  pub fn backend(config: &BackendConfig, api_key: Option<String>) -> Result<Self> {
    let handler: Arc<dyn ActionHandler> = Arc::new(BackendActionHandler::new(config, api_key)?);
    let mut registry = Self::new();
    for kind in ActionKind::ALL {
      registry.register(kind, handler.clone());
    }
    Ok(registry)
  }

  pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
    self.handlers.insert(kind, handler);
  }

  pub fn with_handler(mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
    self.register(kind, handler);
    self
  }

  pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionHandler>> {
    self.handlers.get(&kind).cloned()
  }
}

impl<F> ActionHandler for F
where
  F: Fn(&QueuedAction) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
  fn replay(&self, action: &QueuedAction) -> BoxFuture<'static, Result<()>> {
    self(action)
  }
}

/// Inserts the action's payload into its backend table over REST.
pub struct BackendActionHandler {
  client: reqwest::Client,
  base_url: String,
  api_key: Option<String>,
}

impl BackendActionHandler {
  pub fn new(config: &BackendConfig, api_key: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: format!(
        "{}{}",
        config.url.trim_end_matches('/'),
        config.rest_path
      ),
      api_key: api_key.or_else(Config::get_api_key),
    })
  }

  fn endpoint(&self, kind: ActionKind) -> String {
    format!("{}/{}", self.base_url, kind.table())
  }
}

impl ActionHandler for BackendActionHandler {
  fn replay(&self, action: &QueuedAction) -> BoxFuture<'static, Result<()>> {
    let url = self.endpoint(action.kind);
    let mut request = self.client.post(&url).json(&action.data);
    if let Some(key) = &self.api_key {
      request = request.header("apikey", key).bearer_auth(key);
    }
    let id = action.id.clone();

    Box::pin(async move {
      let response = request
        .send()
        .await
        .map_err(|e| eyre!("Network error replaying {}: {}", id, e))?;

      let status = response.status();
      if !status.is_success() {
        return Err(eyre!("Backend rejected {} with status {}", id, status));
      }

      debug!(%id, %url, "action replayed");
      Ok(())
    })
  }
}
