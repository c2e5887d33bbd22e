use rusqlite::{Connection, OptionalExtension, Row};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use super::links::IncomingLink;
use super::tags::ObjectTag;

/// Mutable part of a cached object, mirrored from its `Objects` row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectState {
  pub server_id: Option<i64>,
  pub typ: Option<String>,
  pub nr: Option<String>,
  pub mime_type: Option<String>,
  pub is_rev: bool,
  pub remote_rev_id: Option<i64>,
  pub pulled_rev_id: Option<i64>,
  pub sync_token: i64,
  /// Local changes not yet pushed to the server
  pub is_document_changed: bool,
  pub has_data: bool,
}

/// A business object cached in the local store.
///
/// Instances are shared through the [`ObjectStore`](super::ObjectStore):
/// while any `Arc` is alive, every lookup of the same row returns it.
#[derive(Debug)]
pub struct PpsObject {
  local_id: i64,
  guid: Uuid,
  state: RwLock<ObjectState>,
}

impl PpsObject {
  pub(super) fn new(local_id: i64, guid: Uuid, state: ObjectState) -> Self {
    Self {
      local_id,
      guid,
      state: RwLock::new(state),
    }
  }

  pub fn local_id(&self) -> i64 {
    self.local_id
  }

  pub fn guid(&self) -> Uuid {
    self.guid
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> ObjectState {
    self
      .state
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn server_id(&self) -> Option<i64> {
    self.state().server_id
  }

  pub fn typ(&self) -> Option<String> {
    self.state().typ
  }

  pub fn is_document_changed(&self) -> bool {
    self.state().is_document_changed
  }

  pub fn has_data(&self) -> bool {
    self.state().has_data
  }

  pub(super) fn set_state(&self, state: ObjectState) {
    *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
  }
}

/// One row of the server's object list view.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerObjectRow {
  pub id: i64,
  pub guid: Uuid,
  pub typ: String,
  pub nr: Option<String>,
  pub mime_type: Option<String>,
  pub is_rev: bool,
  /// Head revision on the server
  pub rev_id: Option<i64>,
  pub sync_token: i64,
  pub tags: Vec<ObjectTag>,
  pub links: Vec<IncomingLink>,
}

/// A document pulled from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledDocument {
  pub content: Vec<u8>,
  pub mime_type: Option<String>,
  pub rev_id: Option<i64>,
}

pub(super) const SELECT_OBJECT: &str = "SELECT [Id], [Guid], [ServerId], [Typ], [Nr], [MimeType], [IsRev], [RemoteRevId], [PulledRevId], [SyncToken], [IsDocumentChanged], [Document] IS NOT NULL FROM main.[Objects]";

/// Read `(local_id, guid, state)` from a row selected with [`SELECT_OBJECT`].
pub(super) fn read_object_row(row: &Row<'_>) -> rusqlite::Result<(i64, Uuid, ObjectState)> {
  Ok((
    row.get(0)?,
    guid_column(row, 1)?,
    ObjectState {
      server_id: row.get(2)?,
      typ: row.get(3)?,
      nr: row.get(4)?,
      mime_type: row.get(5)?,
      is_rev: row.get(6)?,
      remote_rev_id: row.get(7)?,
      pulled_rev_id: row.get(8)?,
      sync_token: row.get(9)?,
      is_document_changed: row.get(10)?,
      has_data: row.get(11)?,
    },
  ))
}

/// Load one object row by a column of `SELECT_OBJECT`'s table.
pub(super) fn load_object(
  conn: &Connection,
  column: &str,
  value: &dyn rusqlite::ToSql,
) -> rusqlite::Result<Option<(i64, Uuid, ObjectState)>> {
  conn
    .query_row(
      &format!("{} WHERE [{}] = ?1", SELECT_OBJECT, column),
      [value],
      read_object_row,
    )
    .optional()
}

/// GUIDs are stored as hyphenated text.
pub(super) fn guid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
  let text: String = row.get(idx)?;
  Uuid::parse_str(&text).map_err(|e| {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
  })
}
