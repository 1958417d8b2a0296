//! Cache partition storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::http::{Request, Response};
use crate::db::{parse_datetime, Database};

/// A stored response and where it was found.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub partition: String,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Partitions are named buckets of request/response pairs, listed in the
/// order they were created.
pub trait CacheStorage: Send + Sync {
  /// Create the partition if it does not exist.
  fn open(&self, partition: &str) -> Result<()>;

  /// Names of all partitions, oldest first.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Delete a partition and everything in it. Returns false if it did not exist.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Store a response, creating the partition on demand.
  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()>;

  /// Look up a request in one partition.
  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request across all partitions, oldest partition first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open(&self, _partition: &str) -> Result<()> {
    Ok(())
  }

  fn partitions(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_partition(&self, _partition: &str) -> Result<bool> {
    Ok(false)
  }

  fn put(&self, _partition: &str, _request: &Request, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn match_in(&self, _partition: &str, _request: &Request) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn match_any(&self, _request: &Request) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn read_entry(row: &Row<'_>) -> rusqlite::Result<(String, String, u16, String, Vec<u8>, String)> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn into_cached(
  (partition, url, status, headers, body, cached_at): (String, String, u16, String, Vec<u8>, String),
) -> Result<CachedResponse> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers for {}: {}", url, e))?;

  Ok(CachedResponse {
    response: Response {
      url,
      status,
      headers,
      body,
    },
    partition,
    cached_at: parse_datetime(&cached_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    self.db.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
          params![partition],
        )
        .map_err(|e| eyre!("Failed to open cache partition {}: {}", partition, e))?;
      Ok(())
    })
  }

  fn partitions(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT name FROM cache_partitions ORDER BY rowid")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list cache partitions: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read cache partition: {}", e))?;

      Ok(names)
    })
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let tx = conn
        .unchecked_transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      tx.execute(
        "DELETE FROM cache_entries WHERE partition = ?",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", partition, e))?;

      let deleted = tx
        .execute(
          "DELETE FROM cache_partitions WHERE name = ?",
          params![partition],
        )
        .map_err(|e| eyre!("Failed to delete cache partition {}: {}", partition, e))?;

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(deleted > 0)
    })
  }

  fn put(&self, partition: &str, request: &Request, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let key = request.cache_key();

    self.db.with_conn(|conn| {
      let tx = conn
        .unchecked_transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      tx.execute(
        "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| eyre!("Failed to open cache partition {}: {}", partition, e))?;

      tx.execute(
        "INSERT OR REPLACE INTO cache_entries (partition, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          partition,
          key,
          request.url.as_str(),
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", request.url, partition, e))?;

      tx.commit()
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

      Ok(())
    })
  }

  fn match_in(&self, partition: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let key = request.cache_key();
    let entry = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT partition, url, status, headers, body, cached_at FROM cache_entries
           WHERE partition = ? AND request_key = ?",
          params![partition, key],
          read_entry,
        )
        .optional()
        .map_err(|e| eyre!("Failed to look up {} in {}: {}", request.url, partition, e))
    })?;

    entry.map(into_cached).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    let key = request.cache_key();
    let entry = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT ce.partition, ce.url, ce.status, ce.headers, ce.body, ce.cached_at
           FROM cache_entries ce
           INNER JOIN cache_partitions cp ON cp.name = ce.partition
           WHERE ce.request_key = ?
           ORDER BY cp.rowid
           LIMIT 1",
          params![key],
          read_entry,
        )
        .optional()
        .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))
    })?;

    entry.map(into_cached).transpose()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://habesha.example").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_put_and_match() {
    let storage = storage();
    let req = request("/offline.html");
    let mut response = Response::new(req.url.as_str(), 200, "<h1>Offline</h1>");
    response
      .headers
      .push(("content-type".to_string(), "text/html".to_string()));

    storage.put("habesha-v1", &req, &response).unwrap();

    let cached = storage.match_in("habesha-v1", &req).unwrap().unwrap();
    assert_eq!(cached.response, response);
    assert_eq!(cached.partition, "habesha-v1");
    assert!((Utc::now() - cached.cached_at).num_seconds().abs() < 60);
    assert!(storage.match_in("habesha-runtime", &req).unwrap().is_none());
    assert!(storage.match_any(&request("/missing")).unwrap().is_none());
  }

  #[test]
  fn test_match_any_prefers_oldest_partition() {
    let storage = storage();
    let req = request("/");
    storage.open("habesha-v1").unwrap();
    storage.open("habesha-runtime").unwrap();

    storage
      .put("habesha-runtime", &req, &Response::new(req.url.as_str(), 200, "runtime"))
      .unwrap();
    storage
      .put("habesha-v1", &req, &Response::new(req.url.as_str(), 200, "shell"))
      .unwrap();

    let cached = storage.match_any(&req).unwrap().unwrap();
    assert_eq!(cached.partition, "habesha-v1");
    assert_eq!(cached.response.body, b"shell");
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let storage = storage();
    let req = request("/api/events");
    storage
      .put("habesha-runtime", &req, &Response::new(req.url.as_str(), 200, "old"))
      .unwrap();
    storage
      .put("habesha-runtime", &req, &Response::new(req.url.as_str(), 200, "new"))
      .unwrap();

    let cached = storage.match_in("habesha-runtime", &req).unwrap().unwrap();
    assert_eq!(cached.response.body, b"new");
  }

  #[test]
  fn test_delete_partition_removes_entries() {
    let storage = storage();
    let req = request("/");
    storage
      .put("habesha-v0", &req, &Response::new(req.url.as_str(), 200, "stale"))
      .unwrap();
    storage.open("habesha-v1").unwrap();

    assert_eq!(storage.partitions().unwrap(), vec!["habesha-v0", "habesha-v1"]);
    assert!(storage.delete_partition("habesha-v0").unwrap());
    assert!(!storage.delete_partition("habesha-v0").unwrap());

    assert_eq!(storage.partitions().unwrap(), vec!["habesha-v1"]);
    assert!(storage.match_any(&req).unwrap().is_none());
  }

  #[test]
  fn test_noop_storage_never_hits() {
    let storage = NoopStorage;
    let req = request("/");
    storage
      .put("habesha-v1", &req, &Response::new(req.url.as_str(), 200, "x"))
      .unwrap();
    assert!(storage.match_any(&req).unwrap().is_none());
    assert!(storage.partitions().unwrap().is_empty());
  }
}
