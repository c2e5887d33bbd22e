//! Typed relations between objects.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// What happens to the parent when the linked object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOnDelete {
  Restrict,
  Cascade,
  SetNull,
}

impl LinkOnDelete {
  pub fn code(self) -> char {
    match self {
      Self::Restrict => 'R',
      Self::Cascade => 'C',
      Self::SetNull => 'N',
    }
  }

  pub fn from_code(code: &str) -> Result<Self> {
    match code.trim() {
      "R" | "r" | "" => Ok(Self::Restrict),
      "C" | "c" => Ok(Self::Cascade),
      "N" | "n" => Ok(Self::SetNull),
      other => Err(eyre!("Unknown link delete policy '{}'", other)),
    }
  }
}

/// A live link of an object, resolved to the local id of its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLink {
  pub link_object_id: i64,
  pub link_guid: Uuid,
  pub on_delete: LinkOnDelete,
  pub sync_token: i64,
}

/// A link as delivered by the server, naming its target by server id and
/// GUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingLink {
  pub server_id: i64,
  pub guid: Uuid,
  pub on_delete: LinkOnDelete,
  pub sync_token: i64,
  pub removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkChanges {
  pub inserted: usize,
  pub updated: usize,
  pub removed: usize,
  /// Placeholder rows created for unknown targets
  pub placeholders: usize,
  /// Local-only targets that received their server id from a link
  pub completed: Vec<i64>,
}

struct LocalLink {
  id: i64,
  sync_token: i64,
  removed: bool,
}

pub fn read_links(conn: &Connection, object_id: i64) -> Result<Vec<ObjectLink>> {
  let mut stmt = conn.prepare_cached(
    "SELECT l.[LinkObjectId], o.[Guid], l.[OnDelete], l.[SyncToken]
     FROM main.[ObjectLinks] l
     INNER JOIN main.[Objects] o ON o.[Id] = l.[LinkObjectId]
     WHERE l.[ParentObjectId] = ?1 AND l.[IsRemoved] = 0
     ORDER BY l.[LinkObjectId]",
  )?;
  let rows = stmt
    .query_map(params![object_id], |row| {
      Ok((
        row.get::<_, i64>(0)?,
        super::object::guid_column(row, 1)?,
        row.get::<_, String>(2)?,
        row.get::<_, i64>(3)?,
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  rows
    .into_iter()
    .map(|(link_object_id, link_guid, on_delete, sync_token)| {
      Ok(ObjectLink {
        link_object_id,
        link_guid,
        on_delete: LinkOnDelete::from_code(&on_delete)?,
        sync_token,
      })
    })
    .collect()
}

/// Local id of a link target. An unknown target gets a placeholder row
/// when `create` is set and resolves to `None` otherwise.
fn resolve_target(
  conn: &Connection,
  link: &IncomingLink,
  create: bool,
  changes: &mut LinkChanges,
) -> Result<Option<i64>> {
  let guid = link.guid.to_string();
  let found: Option<(i64, Option<i64>)> = conn
    .query_row(
      "SELECT [Id], [ServerId] FROM main.[Objects] WHERE [Guid] = ?1",
      params![guid],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?;

  match found {
    Some((_, Some(server_id))) if server_id != link.server_id => Err(eyre!(
      "Link target {} has server id {}, server reports {}",
      link.guid,
      server_id,
      link.server_id
    )),
    Some((id, Some(_))) => Ok(Some(id)),
    Some((id, None)) => {
      conn.execute(
        "UPDATE main.[Objects] SET [ServerId] = ?2 WHERE [Id] = ?1",
        params![id, link.server_id],
      )?;
      changes.completed.push(id);
      Ok(Some(id))
    }
    None if !create => Ok(None),
    None => {
      conn.execute(
        "INSERT INTO main.[Objects] ([ServerId], [Guid]) VALUES (?1, ?2)",
        params![link.server_id, guid],
      )?;
      changes.placeholders += 1;
      debug!(guid = %link.guid, server_id = link.server_id, "placeholder object created for link target");
      Ok(Some(conn.last_insert_rowid()))
    }
  }
}

/// Merge incoming links into the object's links, with the same token rule
/// as tags: the incoming entry wins when the local token is not newer.
pub fn reconcile(
  conn: &Connection,
  object_id: i64,
  incoming: &[IncomingLink],
  remove_missing: bool,
) -> Result<LinkChanges> {
  let mut changes = LinkChanges::default();

  let mut local: HashMap<i64, LocalLink> = {
    let mut stmt = conn.prepare_cached(
      "SELECT [Id], [LinkObjectId], [SyncToken], [IsRemoved] FROM main.[ObjectLinks] WHERE [ParentObjectId] = ?1",
    )?;
    let links = stmt
      .query_map(params![object_id], |row| {
        Ok((
          row.get::<_, i64>(1)?,
          LocalLink {
            id: row.get(0)?,
            sync_token: row.get(2)?,
            removed: row.get(3)?,
          },
        ))
      })?
      .collect::<rusqlite::Result<HashMap<_, _>>>()?;
    links
  };

  let mut insert = conn.prepare_cached(
    "INSERT INTO main.[ObjectLinks] ([ParentObjectId], [LinkObjectId], [OnDelete], [SyncToken]) VALUES (?1, ?2, ?3, ?4)",
  )?;
  let mut update = conn.prepare_cached(
    "UPDATE main.[ObjectLinks] SET [OnDelete] = ?2, [SyncToken] = ?3, [IsRemoved] = 0 WHERE [Id] = ?1",
  )?;
  let mut remove = conn.prepare_cached(
    "UPDATE main.[ObjectLinks] SET [IsRemoved] = 1, [SyncToken] = ?2 WHERE [Id] = ?1",
  )?;

  let mut seen = HashSet::new();
  for link in incoming {
    // a removed link never needs a placeholder
    let Some(target) = resolve_target(conn, link, !link.removed, &mut changes)? else {
      continue;
    };
    seen.insert(target);

    match local.get_mut(&target) {
      Some(existing) if existing.sync_token <= link.sync_token => {
        if link.removed {
          remove.execute(params![existing.id, link.sync_token])?;
          if !existing.removed {
            changes.removed += 1;
          }
        } else {
          update.execute(params![existing.id, link.on_delete.code().to_string(), link.sync_token])?;
          changes.updated += 1;
        }
        existing.removed = link.removed;
        existing.sync_token = link.sync_token;
      }
      Some(_) => {}
      None if link.removed => {}
      None => {
        insert.execute(params![
          object_id,
          target,
          link.on_delete.code().to_string(),
          link.sync_token
        ])?;
        local.insert(
          target,
          LocalLink {
            id: conn.last_insert_rowid(),
            sync_token: link.sync_token,
            removed: false,
          },
        );
        changes.inserted += 1;
      }
    }
  }

  if remove_missing {
    for (target, existing) in &local {
      if !existing.removed && !seen.contains(target) {
        remove.execute(params![existing.id, existing.sync_token])?;
        changes.removed += 1;
      }
    }
  }

  Ok(changes)
}
