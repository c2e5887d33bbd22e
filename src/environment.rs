//! One configured server environment: its local store, object cache,
//! offline resources and server connection.

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheResult, RefreshReport, Resource, ResourceCache, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::objects::{ObjectStore, ServerObjectRow, SyncRequest, SyncWorker, WorkerReport};
use crate::remote::RemoteClient;

/// Rows requested per page of the server list view.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Outcome of a list pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
  pub refreshed: usize,
  pub failed: usize,
}

pub struct Environment {
  config: Config,
  db: Arc<Database>,
  objects: Arc<ObjectStore>,
  resources: ResourceCache<SqliteStorage>,
  /// `None` while offline
  client: Option<RemoteClient>,
}

impl Environment {
  /// Open the environment's local store and, unless offline, prepare the
  /// server connection.
  pub fn open(config: Config) -> Result<Self> {
    let path = config.database_path()?;
    let db = Arc::new(Database::open(&path)?);
    let client = if config.offline {
      None
    } else {
      Some(RemoteClient::new(&config)?)
    };
    Ok(Self::with_database(config, db, client))
  }

  pub fn with_database(config: Config, db: Arc<Database>, client: Option<RemoteClient>) -> Self {
    let storage =
      SqliteStorage::new(Arc::clone(&db)).with_compress_threshold(config.resources.compress_threshold);
    Self {
      objects: Arc::new(ObjectStore::new(Arc::clone(&db))),
      resources: ResourceCache::new(storage),
      config,
      db,
      client,
    }
  }

  pub fn name(&self) -> &str {
    &self.config.environment.name
  }

  pub fn database(&self) -> &Arc<Database> {
    &self.db
  }

  pub fn objects(&self) -> &ObjectStore {
    &self.objects
  }

  pub fn resources(&self) -> &ResourceCache<SqliteStorage> {
    &self.resources
  }

  pub fn is_online(&self) -> bool {
    self.client.is_some()
  }

  pub fn client(&self) -> Result<&RemoteClient> {
    self
      .client
      .as_ref()
      .ok_or_else(|| eyre!("Environment {} is offline", self.name()))
  }

  /// Fetch the server's object list page by page and merge every row into
  /// the local store. A row that fails to convert or merge is logged and
  /// counted as failed.
  pub async fn pull_list(
    &self,
    filter: Option<&str>,
    remove_missing: bool,
    page_size: usize,
  ) -> Result<PullReport> {
    let client = self.client()?;
    let page_size = page_size.max(1);
    let mut report = PullReport::default();
    let mut start = 0;

    loop {
      let page = client
        .list_objects(filter, start, page_size)
        .await
        .wrap_err("Failed to fetch object list")?;
      let fetched = page.len();

      let mut rows = Vec::with_capacity(fetched);
      for row in page {
        match row {
          Ok(row) => rows.push(row),
          Err(e) => {
            warn!(start, error = %e, "skipping malformed object row");
            report.failed += 1;
          }
        }
      }

      let objects = Arc::clone(&self.objects);
      let merged = tokio::task::spawn_blocking(move || merge_rows(&objects, &rows, remove_missing))
        .await
        .map_err(|e| eyre!("Object merge task failed: {}", e))?;
      report.refreshed += merged.refreshed;
      report.failed += merged.failed;

      if fetched < page_size {
        break;
      }
      start += fetched;
    }

    info!(
      environment = self.name(),
      refreshed = report.refreshed,
      failed = report.failed,
      "object list pulled"
    );
    Ok(report)
  }

  /// Merge already fetched list rows.
  pub fn refresh_rows(&self, rows: &[ServerObjectRow], remove_missing: bool) -> PullReport {
    merge_rows(&self.objects, rows, remove_missing)
  }

  /// Download the document of a local object.
  pub async fn pull_object(&self, local_id: i64, force: bool) -> Result<()> {
    let object = self
      .objects
      .get_object(local_id)?
      .ok_or_else(|| eyre!("Object {} not found", local_id))?;
    let server_id = object
      .server_id()
      .ok_or_else(|| eyre!("Object {} exists only locally", object.guid()))?;
    if object.is_document_changed() && !force {
      return Err(eyre!(
        "Object {} has local changes; pull with force to overwrite them",
        object.guid()
      ));
    }

    let document = self.client()?.pull(server_id, None).await?;
    self.objects.apply_pulled_data(&object, &document, force)
  }

  /// Resolve a resource request path through the offline cache.
  pub async fn resolve_resource(&self, request_path: &str) -> Result<CacheResult<Resource>> {
    let client = self.client.as_ref();
    let online = client.is_some();
    self
      .resources
      .resolve(request_path, online, |path| async move {
        match client {
          Some(client) => client.get_resource(&path).await,
          None => Err(eyre!("Resource {} requires a server connection", path)),
        }
      })
      .await
  }

  /// Compare the cache against the server's resource listing and refetch
  /// what changed.
  pub async fn refresh_resources(&self) -> Result<RefreshReport> {
    let client = self.client()?;
    let info = client.server_info().await?;
    info!(version = %info.version, files = info.files.len(), "server resource listing");

    self
      .resources
      .refresh(&info.files, |path| async move { client.get_resource(&path).await })
      .await
  }

  /// Start a background worker that runs document pulls against this
  /// environment.
  pub fn spawn_worker(self: &Arc<Self>) -> (SyncWorker, JoinHandle<WorkerReport>) {
    let env = Arc::clone(self);
    SyncWorker::spawn(move |request| {
      let env = Arc::clone(&env);
      async move {
        match request {
          SyncRequest::Pull { local_id, force } => env.pull_object(local_id, force).await,
        }
      }
    })
  }
}

fn merge_rows(objects: &ObjectStore, rows: &[ServerObjectRow], remove_missing: bool) -> PullReport {
  let mut report = PullReport::default();
  for row in rows {
    match objects.refresh_object(row, remove_missing) {
      Ok(_) => report.refreshed += 1,
      Err(e) => {
        warn!(guid = %row.guid, server_id = row.id, error = %e, "failed to refresh object");
        report.failed += 1;
      }
    }
  }
  report
}
