//! Key/value storage with browser local-storage semantics.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::Database;

/// String key/value store. Values are replaced whole, never patched.
pub trait LocalStorage: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>>;

  fn set_item(&self, key: &str, value: &str) -> Result<()>;

  fn remove_item(&self, key: &str) -> Result<()>;
}

/// Durable local storage backed by the `local_storage` table.
pub struct SqliteLocalStorage {
  db: Arc<Database>,
}

impl SqliteLocalStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl LocalStorage for SqliteLocalStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT value FROM local_storage WHERE key = ?",
          params![key],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read local storage key {}: {}", key, e))
    })
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO local_storage (key, value, updated_at)
           VALUES (?, ?, datetime('now'))",
          params![key, value],
        )
        .map_err(|e| eyre!("Failed to write local storage key {}: {}", key, e))?;
      Ok(())
    })
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute("DELETE FROM local_storage WHERE key = ?", params![key])
        .map_err(|e| eyre!("Failed to remove local storage key {}: {}", key, e))?;
      Ok(())
    })
  }
}

/// Process-local storage, lost on drop.
#[derive(Default)]
pub struct MemoryLocalStorage {
  items: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl LocalStorage for MemoryLocalStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    let items = self.items.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(items.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    let mut items = self.items.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    items.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    let mut items = self.items.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    items.remove(key);
    Ok(())
  }
}
