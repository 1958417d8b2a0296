//! Draft autosave for unfinished forms (listings, messages, profiles).

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::db::LocalStorage;

/// Local storage key holding every draft
pub const STORAGE_KEY: &str = "drafts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
  pub data: serde_json::Value,
  /// Epoch milliseconds of the last save
  pub saved_at: i64,
}

pub struct DraftStore {
  storage: Arc<dyn LocalStorage>,
}

impl DraftStore {
  pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
    Self { storage }
  }

  /// Save or overwrite the draft for `key`.
  pub fn save(&self, key: &str, data: serde_json::Value) -> Result<Draft> {
    let mut drafts = self.read();
    let draft = Draft {
      data,
      saved_at: Utc::now().timestamp_millis(),
    };
    drafts.insert(key.to_string(), draft.clone());
    self.write(&drafts)?;
    Ok(draft)
  }

  pub fn load(&self, key: &str) -> Option<Draft> {
    self.read().remove(key)
  }

  /// Remove the draft for `key`. Returns false if there was none.
  pub fn discard(&self, key: &str) -> Result<bool> {
    let mut drafts = self.read();
    if drafts.remove(key).is_none() {
      return Ok(false);
    }
    self.write(&drafts)?;
    Ok(true)
  }

  /// All drafts, ordered by key
  pub fn list(&self) -> Vec<(String, Draft)> {
    self.read().into_iter().collect()
  }

  /// Drop drafts older than `max_age`. Returns how many were removed.
  pub fn prune(&self, max_age: Duration) -> Result<usize> {
    let cutoff = (Utc::now() - max_age).timestamp_millis();
    let mut drafts = self.read();
    let before = drafts.len();
    drafts.retain(|_, draft| draft.saved_at >= cutoff);

    let removed = before - drafts.len();
    if removed > 0 {
      self.write(&drafts)?;
    }
    Ok(removed)
  }

  fn read(&self) -> BTreeMap<String, Draft> {
    let json = match self.storage.get_item(STORAGE_KEY) {
      Ok(Some(json)) => json,
      Ok(None) => return BTreeMap::new(),
      Err(e) => {
        warn!("failed to read drafts: {}", e);
        return BTreeMap::new();
      }
    };

    serde_json::from_str(&json).unwrap_or_else(|e| {
      warn!("discarding unreadable drafts: {}", e);
      BTreeMap::new()
    })
  }

  /// Rewrite the stored map. The key is removed once no drafts remain.
  fn write(&self, drafts: &BTreeMap<String, Draft>) -> Result<()> {
    if drafts.is_empty() {
      return self.storage.remove_item(STORAGE_KEY);
    }
    let json =
      serde_json::to_string(drafts).map_err(|e| eyre!("Failed to serialize drafts: {}", e))?;
    self.storage.set_item(STORAGE_KEY, &json)
  }
}
