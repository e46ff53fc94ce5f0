//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{CacheKey, CachedResponse};
use crate::http::{Header, Request, Response};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, name: &str) -> Result<()>;

  /// All namespace names, oldest first.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Drop a namespace and every entry in it. Returns false if it did not exist.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry for the same request.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store several responses at once. Either all are written or none.
  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Find the stored response for a request.
  fn lookup(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Number of entries in a namespace.
  fn entry_count(&self, name: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Create a throwaway in-memory storage.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per request identity per namespace
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, request_hash)
);
"#;

fn ensure_namespace(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, name: &str, request: &Request, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (namespace, request_hash, request, response_url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request.cache_hash(),
        request.description(),
        response.url.as_str(),
        response.status,
        headers,
        response.body(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", request.description(), e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_namespace(&conn, name)
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM namespaces ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read namespace: {}", e))?;

    Ok(names)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    ensure_namespace(&conn, name)?;
    insert_entry(&conn, name, request, response)
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, name)?;
    for (request, response) in entries {
      insert_entry(&tx, name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lookup(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT response_url, status, headers, body, cached_at FROM entries
         WHERE namespace = ? AND request_hash = ?",
        params![name, request.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.description(), e))?;

    let Some((response_url, status, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let url = Url::parse(&response_url)
      .map_err(|e| eyre!("Stored URL '{}' is invalid: {}", response_url, e))?;
    let headers: Vec<Header> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

    Ok(Some(CachedResponse {
      response: Response::new(url, status, headers, body),
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE namespace = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
