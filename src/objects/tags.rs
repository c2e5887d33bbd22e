//! Object tags and their reconciliation with server batches.
//!
//! A tag is `(key, class, value, sync_token)`. Deleting a tag keeps its row
//! with the [`TagClass::Deleted`] sentinel, so the sync token survives and an
//! older server batch cannot bring the tag back.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};

/// Value class of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
  /// Deletion sentinel, stored as -1
  Deleted,
  Text,
  Date,
  Number,
  Note,
  Boolean,
}

impl TagClass {
  pub fn code(self) -> i64 {
    match self {
      Self::Deleted => -1,
      Self::Text => 0,
      Self::Date => 1,
      Self::Number => 2,
      Self::Note => 3,
      Self::Boolean => 4,
    }
  }

  pub fn from_code(code: i64) -> Result<Self> {
    Ok(match code {
      -1 => Self::Deleted,
      0 => Self::Text,
      1 => Self::Date,
      2 => Self::Number,
      3 => Self::Note,
      4 => Self::Boolean,
      other => return Err(eyre!("Unknown tag class {}", other)),
    })
  }

  pub fn is_deleted(self) -> bool {
    self == Self::Deleted
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTag {
  pub key: String,
  pub class: TagClass,
  pub value: Option<String>,
  pub sync_token: i64,
}

impl ObjectTag {
  pub fn new(key: &str, class: TagClass, value: Option<&str>, sync_token: i64) -> Self {
    Self {
      key: key.to_string(),
      class,
      value: value.map(String::from),
      sync_token,
    }
  }
}

/// Row counts of one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagChanges {
  pub inserted: usize,
  pub updated: usize,
  pub deleted: usize,
}

impl TagChanges {
  pub fn is_empty(&self) -> bool {
    self.inserted == 0 && self.updated == 0 && self.deleted == 0
  }
}

struct LocalTag {
  id: i64,
  class: i64,
  sync_token: i64,
}

/// Live tags of an object, ordered by key.
pub fn read_tags(conn: &Connection, object_id: i64) -> Result<Vec<ObjectTag>> {
  let mut stmt = conn.prepare_cached(
    "SELECT [Key], [Class], [Value], [SyncToken] FROM main.[ObjectTags]
     WHERE [ObjectId] = ?1 AND [Class] >= 0 ORDER BY [Key]",
  )?;
  let rows = stmt
    .query_map(params![object_id], |row| {
      Ok((
        row.get::<_, String>(0)?,
        row.get::<_, i64>(1)?,
        row.get::<_, Option<String>>(2)?,
        row.get::<_, i64>(3)?,
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  rows
    .into_iter()
    .map(|(key, class, value, sync_token)| {
      Ok(ObjectTag {
        key,
        class: TagClass::from_code(class)?,
        value,
        sync_token,
      })
    })
    .collect()
}

fn local_tags(conn: &Connection, object_id: i64) -> Result<HashMap<String, LocalTag>> {
  let mut stmt = conn.prepare_cached(
    "SELECT [Id], [Key], [Class], [SyncToken] FROM main.[ObjectTags] WHERE [ObjectId] = ?1",
  )?;
  let tags = stmt
    .query_map(params![object_id], |row| {
      Ok((
        row.get::<_, String>(1)?.to_ascii_lowercase(),
        LocalTag {
          id: row.get(0)?,
          class: row.get(2)?,
          sync_token: row.get(3)?,
        },
      ))
    })?
    .collect::<rusqlite::Result<HashMap<_, _>>>()?;
  Ok(tags)
}

/// Merge an incoming tag batch into the object's tags.
///
/// A local tag whose sync token is less than or equal to the incoming one is
/// overwritten (or marked deleted for the sentinel class); a newer local tag
/// wins. Local tags missing from the batch are marked deleted only when
/// `remove_missing` is set. Runs in the caller's transaction.
pub fn reconcile(
  conn: &Connection,
  object_id: i64,
  incoming: &[ObjectTag],
  remove_missing: bool,
) -> Result<TagChanges> {
  let mut local = local_tags(conn, object_id)?;
  let mut changes = TagChanges::default();
  let mut seen = HashSet::new();

  let mut insert = conn.prepare_cached(
    "INSERT INTO main.[ObjectTags] ([ObjectId], [Key], [Class], [Value], [SyncToken]) VALUES (?1, ?2, ?3, ?4, ?5)",
  )?;
  let mut update = conn.prepare_cached(
    "UPDATE main.[ObjectTags] SET [Key] = ?2, [Class] = ?3, [Value] = ?4, [SyncToken] = ?5 WHERE [Id] = ?1",
  )?;
  let mut delete = conn.prepare_cached(
    "UPDATE main.[ObjectTags] SET [Class] = -1, [Value] = NULL, [SyncToken] = ?2 WHERE [Id] = ?1",
  )?;

  for tag in incoming {
    let key = tag.key.to_ascii_lowercase();
    seen.insert(key.clone());

    match local.get_mut(&key) {
      Some(existing) if existing.sync_token <= tag.sync_token => {
        if tag.class.is_deleted() {
          delete.execute(params![existing.id, tag.sync_token])?;
          if existing.class >= 0 {
            changes.deleted += 1;
          }
        } else {
          update.execute(params![
            existing.id,
            tag.key,
            tag.class.code(),
            tag.value,
            tag.sync_token
          ])?;
          changes.updated += 1;
        }
        existing.class = tag.class.code();
        existing.sync_token = tag.sync_token;
      }
      Some(_) => {} // local change is newer
      None if tag.class.is_deleted() => {}
      None => {
        insert.execute(params![
          object_id,
          tag.key,
          tag.class.code(),
          tag.value,
          tag.sync_token
        ])?;
        local.insert(
          key,
          LocalTag {
            id: conn.last_insert_rowid(),
            class: tag.class.code(),
            sync_token: tag.sync_token,
          },
        );
        changes.inserted += 1;
      }
    }
  }

  if remove_missing {
    for (key, existing) in &local {
      if existing.class >= 0 && !seen.contains(key) {
        delete.execute(params![existing.id, existing.sync_token])?;
        changes.deleted += 1;
      }
    }
  }

  Ok(changes)
}

/// Set a tag from a local edit. The sync token advances past the stored one,
/// so the edit survives server batches carrying the old token.
pub fn set_tag(
  conn: &Connection,
  object_id: i64,
  key: &str,
  class: TagClass,
  value: Option<&str>,
) -> Result<()> {
  if class.is_deleted() {
    return remove_tag(conn, object_id, key).map(|_| ());
  }

  let token = next_token(conn, object_id, key)?;
  conn.execute(
    "INSERT INTO main.[ObjectTags] ([ObjectId], [Key], [Class], [Value], [SyncToken]) VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT ([ObjectId], [Key]) DO UPDATE SET [Class] = excluded.[Class], [Value] = excluded.[Value], [SyncToken] = excluded.[SyncToken]",
    params![object_id, key, class.code(), value, token],
  )?;
  Ok(())
}

/// Mark a tag deleted from a local edit. Returns whether a live tag existed.
pub fn remove_tag(conn: &Connection, object_id: i64, key: &str) -> Result<bool> {
  let token = next_token(conn, object_id, key)?;
  let changed = conn.execute(
    "UPDATE main.[ObjectTags] SET [Class] = -1, [Value] = NULL, [SyncToken] = ?3
     WHERE [ObjectId] = ?1 AND [Key] = ?2 AND [Class] >= 0",
    params![object_id, key, token],
  )?;
  Ok(changed > 0)
}

fn next_token(conn: &Connection, object_id: i64, key: &str) -> Result<i64> {
  let current: Option<i64> = conn
    .query_row(
      "SELECT [SyncToken] FROM main.[ObjectTags] WHERE [ObjectId] = ?1 AND [Key] = ?2",
      params![object_id, key],
      |row| row.get(0),
    )
    .optional()?;
  Ok(current.map_or(1, |token| token + 1))
}
