use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info};
use uuid::Uuid;

use super::links::{self, ObjectLink};
use super::object::{guid_column, load_object, ObjectState, PpsObject, PulledDocument, ServerObjectRow};
use super::tags::{self, ObjectTag, TagClass};
use super::view::{self, ObjectViewRow, ViewQuery};
use crate::db::Database;

const MIN_PRUNE_AT: usize = 64;

/// Weak references to the live object instances.
struct ObjectIndex {
  by_id: HashMap<i64, Weak<PpsObject>>,
  by_guid: HashMap<Uuid, i64>,
  /// Size at which dead entries are swept next
  prune_at: usize,
}

impl ObjectIndex {
  fn new() -> Self {
    Self {
      by_id: HashMap::new(),
      by_guid: HashMap::new(),
      prune_at: MIN_PRUNE_AT,
    }
  }

  fn live(&self, local_id: i64) -> Option<Arc<PpsObject>> {
    self.by_id.get(&local_id).and_then(Weak::upgrade)
  }

  fn register(&mut self, object: &Arc<PpsObject>) {
    self.by_id.insert(object.local_id(), Arc::downgrade(object));
    self.by_guid.insert(object.guid(), object.local_id());
    if self.by_id.len() >= self.prune_at {
      self.prune();
    }
  }

  fn prune(&mut self) {
    let before = self.by_id.len();
    self.by_id.retain(|_, weak| weak.strong_count() > 0);
    let by_id = &self.by_id;
    self.by_guid.retain(|_, id| by_id.contains_key(id));
    self.prune_at = (self.by_id.len() * 2).max(MIN_PRUNE_AT);
    debug!(removed = before - self.by_id.len(), live = self.by_id.len(), "object index pruned");
  }

  /// Replace the state of a live instance. Rows nobody holds are left
  /// alone.
  fn update_live(&mut self, local_id: i64, state: ObjectState) {
    if let Some(object) = self.live(local_id) {
      object.set_state(state);
    }
  }

  /// Return the live instance of a loaded row, or register a new one.
  fn attach(&mut self, local_id: i64, guid: Uuid, state: ObjectState) -> Arc<PpsObject> {
    if let Some(object) = self.live(local_id) {
      object.set_state(state);
      return object;
    }
    let object = Arc::new(PpsObject::new(local_id, guid, state));
    self.register(&object);
    object
  }
}

/// Object cache of one environment.
///
/// Lookups return the same `Arc<PpsObject>` for a row while any strong
/// reference to it is alive. The index lock is always taken before the
/// database lock.
pub struct ObjectStore {
  db: Arc<Database>,
  index: Mutex<ObjectIndex>,
}

impl ObjectStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      db,
      index: Mutex::new(ObjectIndex::new()),
    }
  }

  pub fn database(&self) -> &Arc<Database> {
    &self.db
  }

  fn index(&self) -> Result<MutexGuard<'_, ObjectIndex>> {
    self
      .index
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn get_object(&self, local_id: i64) -> Result<Option<Arc<PpsObject>>> {
    let mut index = self.index()?;
    if let Some(object) = index.live(local_id) {
      return Ok(Some(object));
    }

    let conn = self.db.lock()?;
    let row = load_object(&conn, "Id", &local_id)
      .map_err(|e| eyre!("Failed to load object {}: {}", local_id, e))?;
    Ok(row.map(|(id, guid, state)| index.attach(id, guid, state)))
  }

  pub fn get_object_by_guid(&self, guid: Uuid) -> Result<Option<Arc<PpsObject>>> {
    let mut index = self.index()?;
    if let Some(object) = index.by_guid.get(&guid).and_then(|id| index.live(*id)) {
      return Ok(Some(object));
    }

    let conn = self.db.lock()?;
    let row = load_object(&conn, "Guid", &guid.to_string())
      .map_err(|e| eyre!("Failed to load object {}: {}", guid, e))?;
    Ok(row.map(|(id, guid, state)| index.attach(id, guid, state)))
  }

  pub fn get_object_by_server_id(&self, server_id: i64) -> Result<Option<Arc<PpsObject>>> {
    let mut index = self.index()?;
    let conn = self.db.lock()?;
    let row = load_object(&conn, "ServerId", &server_id)
      .map_err(|e| eyre!("Failed to load object with server id {}: {}", server_id, e))?;
    Ok(row.map(|(id, guid, state)| index.attach(id, guid, state)))
  }

  /// Create a local-only object without a server id.
  pub fn create_object(&self, typ: &str, guid: Option<Uuid>) -> Result<Arc<PpsObject>> {
    let guid = guid.unwrap_or_else(Uuid::new_v4);
    let mut index = self.index()?;

    let (local_id, guid, state) = self
      .db
      .transaction(|tx| {
        tx.execute(
          "INSERT INTO main.[Objects] ([Guid], [Typ]) VALUES (?1, ?2)",
          params![guid.to_string(), typ],
        )?;
        let id = tx.last_insert_rowid();
        load_object(tx, "Id", &id)?.ok_or_else(|| eyre!("Created object {} vanished", id))
      })
      .wrap_err_with(|| format!("Failed to create object {}", guid))?;

    debug!(local_id, %guid, typ, "object created");
    Ok(index.attach(local_id, guid, state))
  }

  /// Merge one row of the server list view into the local store.
  pub fn refresh_object(&self, row: &ServerObjectRow, remove_missing: bool) -> Result<Arc<PpsObject>> {
    let (local_id, state, completed) = self
      .db
      .transaction(|tx| {
        let local_id = match load_object(tx, "Guid", &row.guid.to_string())? {
          Some((id, _, existing)) => {
            check_identity(row, &existing)?;
            tx.execute(
              "UPDATE main.[Objects] SET [ServerId] = ?2, [Typ] = ?3, [Nr] = ?4, [MimeType] = ?5, [IsRev] = ?6, [RemoteRevId] = ?7, [SyncToken] = ?8 WHERE [Id] = ?1",
              params![id, row.id, row.typ, row.nr, row.mime_type, row.is_rev, row.rev_id, row.sync_token],
            )?;
            id
          }
          None => {
            tx.execute(
              "INSERT INTO main.[Objects] ([ServerId], [Guid], [Typ], [Nr], [MimeType], [IsRev], [RemoteRevId], [SyncToken]) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
              params![row.id, row.guid.to_string(), row.typ, row.nr, row.mime_type, row.is_rev, row.rev_id, row.sync_token],
            )?;
            tx.last_insert_rowid()
          }
        };

        let tag_changes = tags::reconcile(tx, local_id, &row.tags, remove_missing)?;
        let link_changes = links::reconcile(tx, local_id, &row.links, remove_missing)?;
        debug!(local_id, ?tag_changes, ?link_changes, "object reconciled");

        // link targets whose rows changed underneath their live instances
        let mut completed = Vec::with_capacity(link_changes.completed.len());
        for target in &link_changes.completed {
          if let Some((id, _, target_state)) = load_object(tx, "Id", target)? {
            completed.push((id, target_state));
          }
        }

        let (_, _, state) =
          load_object(tx, "Id", &local_id)?.ok_or_else(|| eyre!("Refreshed object {} vanished", local_id))?;
        Ok((local_id, state, completed))
      })
      .wrap_err_with(|| format!("Failed to refresh object {} ({})", row.guid, row.id))?;

    let mut index = self.index()?;
    for (id, target_state) in completed {
      index.update_live(id, target_state);
    }
    Ok(index.attach(local_id, row.guid, state))
  }

  /// Store a locally edited document and mark the object changed.
  pub fn save_raw_data(&self, object: &PpsObject, data: &[u8], mime_type: Option<&str>) -> Result<()> {
    let state = self
      .db
      .transaction(|tx| {
        tx.execute(
          "UPDATE main.[Objects] SET [Document] = ?2, [MimeType] = COALESCE(?3, [MimeType]), [IsDocumentChanged] = 1 WHERE [Id] = ?1",
          params![object.local_id(), data, mime_type],
        )?;
        reload(tx, object)
      })
      .wrap_err_with(|| format!("Failed to save document of {}", object.guid()))?;

    object.set_state(state);
    debug!(guid = %object.guid(), bytes = data.len(), "document saved");
    Ok(())
  }

  pub fn load_raw_data(&self, object: &PpsObject) -> Result<Option<Vec<u8>>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "SELECT [Document] FROM main.[Objects] WHERE [Id] = ?1",
        params![object.local_id()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to load document of {}: {}", object.guid(), e))
  }

  /// Store a document pulled from the server. Refused while the object has
  /// unpushed local changes, unless `force` is set.
  pub fn apply_pulled_data(&self, object: &PpsObject, document: &PulledDocument, force: bool) -> Result<()> {
    let state = self
      .db
      .transaction(|tx| {
        let current = reload(tx, object)?;
        if current.is_document_changed && !force {
          return Err(eyre!(
            "Object {} has local changes; pull with force to overwrite them",
            object.guid()
          ));
        }
        tx.execute(
          "UPDATE main.[Objects] SET [Document] = ?2, [MimeType] = COALESCE(?3, [MimeType]), [PulledRevId] = ?4, [IsDocumentChanged] = 0 WHERE [Id] = ?1",
          params![object.local_id(), document.content, document.mime_type, document.rev_id],
        )?;
        reload(tx, object)
      })?;

    object.set_state(state);
    info!(guid = %object.guid(), rev = ?document.rev_id, bytes = document.content.len(), "document pulled");
    Ok(())
  }

  /// Upload local changes. The server side of this is not available, so
  /// the object is left as it is.
  pub fn push(&self, object: &PpsObject) -> Result<()> {
    Err(eyre!("Pushing object {} is not supported", object.guid()))
  }

  pub fn tags(&self, object: &PpsObject) -> Result<Vec<ObjectTag>> {
    let conn = self.db.lock()?;
    tags::read_tags(&conn, object.local_id())
  }

  pub fn links(&self, object: &PpsObject) -> Result<Vec<ObjectLink>> {
    let conn = self.db.lock()?;
    links::read_links(&conn, object.local_id())
  }

  pub fn set_tag(&self, object: &PpsObject, key: &str, class: TagClass, value: Option<&str>) -> Result<()> {
    let state = self
      .db
      .transaction(|tx| {
        tags::set_tag(tx, object.local_id(), key, class, value)?;
        mark_changed(tx, object)?;
        reload(tx, object)
      })
      .wrap_err_with(|| format!("Failed to set tag '{}' on {}", key, object.guid()))?;
    object.set_state(state);
    Ok(())
  }

  /// Returns whether a live tag was removed.
  pub fn remove_tag(&self, object: &PpsObject, key: &str) -> Result<bool> {
    let (removed, state) = self
      .db
      .transaction(|tx| {
        let removed = tags::remove_tag(tx, object.local_id(), key)?;
        if removed {
          mark_changed(tx, object)?;
        }
        Ok((removed, reload(tx, object)?))
      })
      .wrap_err_with(|| format!("Failed to remove tag '{}' from {}", key, object.guid()))?;
    object.set_state(state);
    Ok(removed)
  }

  /// Number of live instances.
  pub fn cached_count(&self) -> Result<usize> {
    let mut index = self.index()?;
    index.prune();
    Ok(index.by_id.len())
  }

  /// Run a view over the local objects.
  pub fn query_view(&self, query: &ViewQuery) -> Result<Vec<ObjectViewRow>> {
    let view = view::build(query)?;
    debug!(sql = %view.sql, "object view");

    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(&view.sql)
      .map_err(|e| eyre!("Failed to prepare object view: {}", e))?;
    let rows = stmt
      .query_map(params_from_iter(view.params.iter()), |row| {
        let mut tags = BTreeMap::new();
        for (i, key) in view.tag_keys.iter().enumerate() {
          tags.insert(key.clone(), row.get::<_, Option<String>>(9 + i)?);
        }
        Ok(ObjectViewRow {
          id: row.get(0)?,
          guid: guid_column(row, 1)?,
          typ: row.get(2)?,
          nr: row.get(3)?,
          server_id: row.get(4)?,
          is_rev: row.get(5)?,
          remote_rev_id: row.get(6)?,
          pulled_rev_id: row.get(7)?,
          is_document_changed: row.get(8)?,
          tags,
        })
      })
      .map_err(|e| eyre!("Failed to run object view: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read object view: {}", e))?;

    Ok(rows)
  }
}

fn check_identity(row: &ServerObjectRow, existing: &ObjectState) -> Result<()> {
  if let Some(typ) = &existing.typ {
    if !typ.eq_ignore_ascii_case(&row.typ) {
      return Err(eyre!(
        "Object {} is a '{}' locally, server reports '{}'",
        row.guid,
        typ,
        row.typ
      ));
    }
  }
  if let Some(server_id) = existing.server_id {
    if server_id != row.id {
      return Err(eyre!(
        "Object {} has server id {} locally, server reports {}",
        row.guid,
        server_id,
        row.id
      ));
    }
  }
  Ok(())
}

fn mark_changed(conn: &Connection, object: &PpsObject) -> Result<()> {
  conn.execute(
    "UPDATE main.[Objects] SET [IsDocumentChanged] = 1 WHERE [Id] = ?1",
    params![object.local_id()],
  )?;
  Ok(())
}

fn reload(conn: &Connection, object: &PpsObject) -> Result<ObjectState> {
  let (_, _, state) = load_object(conn, "Id", &object.local_id())?
    .ok_or_else(|| eyre!("Object {} no longer exists", object.guid()))?;
  Ok(state)
}
