//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rusqlite::{params, OptionalExtension};
use std::io::{Read, Write};
use std::sync::Arc;

use super::traits::Resource;
use crate::db::Database;

/// Payloads below this size are never compressed.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

/// Trait for resource storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get a cached resource by its normalized path.
  fn get(&self, path: &str) -> Result<Option<Resource>>;

  /// Store or replace a resource.
  fn put(&self, resource: &Resource) -> Result<()>;

  /// Stored `(length, last_write_time)` of a resource, without its payload.
  fn state(&self, path: &str) -> Result<Option<(u64, DateTime<Utc>)>>;

  /// Remove a resource. Returns whether a row was deleted.
  fn remove(&self, path: &str) -> Result<bool>;

  /// All cached paths, sorted.
  fn list(&self) -> Result<Vec<String>>;
}

/// SQLite-based resource storage in the environment's local store.
pub struct SqliteStorage {
  db: Arc<Database>,
  compress_threshold: usize,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      db,
      compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
    }
  }

  /// Set the minimum size of textual payloads that are stored compressed.
  pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
    self.compress_threshold = threshold;
    self
  }

  fn should_compress(&self, resource: &Resource) -> bool {
    resource.content.len() >= self.compress_threshold && is_textual(&resource.content_type)
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, path: &str) -> Result<Option<Resource>> {
    let conn = self.db.lock()?;

    let row: Option<(String, Option<String>, i64, bool, Vec<u8>)> = conn
      .query_row(
        "SELECT [ContentType], [Charset], [LastWriteTime], [IsCompressed], [Content]
         FROM main.[OfflineCache] WHERE [Path] = ?1",
        params![path],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached resource {}: {}", path, e))?;

    let Some((content_type, charset, last_write, compressed, payload)) = row else {
      return Ok(None);
    };

    let content = if compressed {
      decompress(&payload).map_err(|e| eyre!("Cached resource {} is corrupt: {}", path, e))?
    } else {
      payload
    };

    Ok(Some(Resource {
      path: path.to_string(),
      content_type,
      charset,
      content,
      last_write_time: from_unix(last_write)?,
    }))
  }

  fn put(&self, resource: &Resource) -> Result<()> {
    let compressed = self.should_compress(resource);
    let payload = if compressed {
      compress(&resource.content)?
    } else {
      resource.content.clone()
    };

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO main.[OfflineCache]
           ([Path], [ContentType], [Charset], [ContentLength], [LastWriteTime], [IsCompressed], [Content], [CachedAt])
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))",
        params![
          resource.path,
          resource.content_type,
          resource.charset,
          resource.length() as i64,
          resource.last_write_time.timestamp(),
          compressed,
          payload
        ],
      )
      .map_err(|e| eyre!("Failed to store resource {}: {}", resource.path, e))?;

    Ok(())
  }

  fn state(&self, path: &str) -> Result<Option<(u64, DateTime<Utc>)>> {
    let conn = self.db.lock()?;

    let row: Option<(i64, i64)> = conn
      .query_row(
        "SELECT [ContentLength], [LastWriteTime] FROM main.[OfflineCache] WHERE [Path] = ?1",
        params![path],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read resource state {}: {}", path, e))?;

    row
      .map(|(length, last_write)| Ok((length as u64, from_unix(last_write)?)))
      .transpose()
  }

  fn remove(&self, path: &str) -> Result<bool> {
    let conn = self.db.lock()?;
    let deleted = conn
      .execute("DELETE FROM main.[OfflineCache] WHERE [Path] = ?1", params![path])
      .map_err(|e| eyre!("Failed to remove resource {}: {}", path, e))?;
    Ok(deleted > 0)
  }

  fn list(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn.prepare("SELECT [Path] FROM main.[OfflineCache] ORDER BY [Path]")?;
    let paths = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(paths)
  }
}

/// Content types worth compressing.
fn is_textual(content_type: &str) -> bool {
  let mime = content_type.trim().to_ascii_lowercase();
  mime.starts_with("text/")
    || mime.ends_with("json")
    || mime.ends_with("xml")
    || mime.ends_with("javascript")
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(data)?;
  Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
  let mut decoder = GzDecoder::new(data);
  let mut out = Vec::new();
  decoder.read_to_end(&mut out)?;
  Ok(out)
}

fn from_unix(seconds: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_opt(seconds, 0)
    .single()
    .ok_or_else(|| eyre!("Invalid timestamp {}", seconds))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())).with_compress_threshold(16)
  }

  fn resource(path: &str, content_type: &str, content: &[u8]) -> Resource {
    Resource {
      path: path.to_string(),
      content_type: content_type.to_string(),
      charset: Some("utf-8".to_string()),
      content: content.to_vec(),
      last_write_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
  }

  fn is_stored_compressed(storage: &SqliteStorage, path: &str) -> bool {
    let conn = storage.db.lock().unwrap();
    conn
      .query_row(
        "SELECT IsCompressed FROM OfflineCache WHERE Path = ?1",
        [path],
        |row| row.get(0),
      )
      .unwrap()
  }

  #[test]
  fn test_missing_resource() {
    let storage = storage();
    assert!(storage.get("nothing.txt").unwrap().is_none());
    assert!(storage.state("nothing.txt").unwrap().is_none());
  }

  #[test]
  fn test_text_is_stored_compressed() {
    let storage = storage();
    let text = "local function main() return 1 end\n".repeat(20);
    storage
      .put(&resource("app/main.lua", "text/plain", text.as_bytes()))
      .unwrap();

    assert!(is_stored_compressed(&storage, "app/main.lua"));
    let cached = storage.get("app/main.lua").unwrap().unwrap();
    assert_eq!(cached.content, text.as_bytes());
    assert_eq!(cached.charset.as_deref(), Some("utf-8"));
  }

  #[test]
  fn test_binary_and_small_payloads_stay_plain() {
    let storage = storage();
    storage
      .put(&resource("logo.png", "image/png", &[0x89, b'P', b'N', b'G'].repeat(10)))
      .unwrap();
    storage
      .put(&resource("tiny.json", "application/json", b"{}"))
      .unwrap();

    assert!(!is_stored_compressed(&storage, "logo.png"));
    assert!(!is_stored_compressed(&storage, "tiny.json"));
  }

  #[test]
  fn test_state_reports_length_and_write_time() {
    let storage = storage();
    let res = resource("a.xml", "application/xml", b"<a>content</a>");
    storage.put(&res).unwrap();

    let (length, written) = storage.state("a.xml").unwrap().unwrap();
    assert_eq!(length, 14);
    assert_eq!(written, res.last_write_time);
  }

  #[test]
  fn test_remove_and_list() {
    let storage = storage();
    storage.put(&resource("b.txt", "text/plain", b"b")).unwrap();
    storage.put(&resource("a.txt", "text/plain", b"a")).unwrap();

    assert_eq!(storage.list().unwrap(), vec!["a.txt", "b.txt"]);
    assert!(storage.remove("a.txt").unwrap());
    assert!(!storage.remove("a.txt").unwrap());
    assert_eq!(storage.list().unwrap(), vec!["b.txt"]);
  }

  #[test]
  fn test_content_type_classification() {
    assert!(is_textual("text/html"));
    assert!(is_textual("application/json"));
    assert!(is_textual("application/xaml+xml"));
    assert!(is_textual("application/javascript"));
    assert!(!is_textual("image/png"));
    assert!(!is_textual("application/pdf"));
  }
}
