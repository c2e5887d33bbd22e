//! Cache layer that resolves resource requests against the local store and
//! the environment's server.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use super::traits::{
  normalize_path, CacheResult, RefreshReport, RemoteFileInfo, Resource, ResourceRoute,
};

/// Offline resource cache.
///
/// Requests are routed by prefix (see [`ResourceRoute`]). Network access is
/// supplied by the caller as a fetcher closure, so the cache itself never
/// talks to the server.
pub struct ResourceCache<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> ResourceCache<S> {
  /// Create a new cache with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Synchronous cache lookup by request path. Remote-only paths always
  /// miss.
  pub fn lookup(&self, request_path: &str) -> Result<Option<Resource>> {
    match ResourceRoute::split(request_path) {
      (ResourceRoute::RemoteOnly, _) => Ok(None),
      (_, path) => self.storage.get(&path),
    }
  }

  /// Resolve a request path.
  ///
  /// 1. `/local/...` - cache only, a miss is an error
  /// 2. `/remote/...` - fetch, nothing is stored
  /// 3. otherwise - serve the cached copy; on a miss fetch, store and serve
  ///
  /// The fetcher receives the normalized path.
  pub async fn resolve<F, Fut>(
    &self,
    request_path: &str,
    online: bool,
    fetcher: F,
  ) -> Result<CacheResult<Resource>>
  where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<Resource>>,
  {
    let (route, path) = ResourceRoute::split(request_path);
    if path.is_empty() {
      return Err(eyre!("Empty resource path: {}", request_path));
    }

    match route {
      ResourceRoute::LocalOnly => self
        .storage
        .get(&path)?
        .map(CacheResult::from_cache)
        .ok_or_else(|| eyre!("Resource {} is not available offline", path)),

      ResourceRoute::RemoteOnly => {
        if !online {
          return Err(eyre!("Resource {} requires a server connection", path));
        }
        Ok(CacheResult::from_network(fetcher(path).await?))
      }

      ResourceRoute::CacheWithOnlineFallback => {
        if let Some(cached) = self.storage.get(&path)? {
          debug!(path = %path, online, "resource served from cache");
          return Ok(if online {
            CacheResult::from_cache(cached)
          } else {
            CacheResult::offline(cached)
          });
        }
        if !online {
          return Err(eyre!("Resource {} is not cached and the environment is offline", path));
        }

        let mut resource = fetcher(path.clone()).await?;
        resource.path = path;
        self.storage.put(&resource)?;
        Ok(CacheResult::from_network(resource))
      }
    }
  }

  /// Whether the cached copy of `info.path` differs from the server listing.
  pub fn needs_refresh(&self, info: &RemoteFileInfo) -> Result<bool> {
    let path = normalize_path(&info.path);
    Ok(match self.storage.state(&path)? {
      Some((length, written)) => {
        length != info.length || written.timestamp() != info.last_write_time.timestamp()
      }
      None => true,
    })
  }

  /// Refetch every listed resource whose cached copy is missing or outdated.
  ///
  /// A failed fetch is logged and counted; it never aborts the batch.
  /// Storage errors do.
  pub async fn refresh<F, Fut>(
    &self,
    listing: &[RemoteFileInfo],
    mut fetcher: F,
  ) -> Result<RefreshReport>
  where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Resource>>,
  {
    let mut report = RefreshReport::default();

    for info in listing {
      if !self.needs_refresh(info)? {
        report.unchanged += 1;
        continue;
      }

      let path = normalize_path(&info.path);
      match fetcher(path.clone()).await {
        Ok(mut resource) => {
          resource.path = path;
          resource.last_write_time = info.last_write_time;
          self.storage.put(&resource)?;
          report.updated += 1;
        }
        Err(e) => {
          warn!(path = %path, error = %e, "failed to refresh offline resource");
          report.failed += 1;
        }
      }
    }

    info!(
      updated = report.updated,
      unchanged = report.unchanged,
      failed = report.failed,
      "offline resources refreshed"
    );
    Ok(report)
  }
}

impl<S: CacheStorage> Clone for ResourceCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use chrono::{DateTime, TimeZone, Utc};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn cache() -> ResourceCache<SqliteStorage> {
    ResourceCache::new(SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())))
  }

  fn written() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
  }

  fn server_resource(path: &str, body: &str) -> Resource {
    Resource {
      path: path.to_string(),
      content_type: "text/plain".to_string(),
      charset: None,
      content: body.as_bytes().to_vec(),
      last_write_time: written(),
    }
  }

  fn listing(path: &str, length: u64) -> RemoteFileInfo {
    RemoteFileInfo {
      path: path.to_string(),
      length,
      last_write_time: written(),
    }
  }

  #[tokio::test]
  async fn test_fallback_fetches_and_stores_on_miss() {
    let cache = cache();

    let result = cache
      .resolve("/app/main.lua", true, |path| async move {
        Ok(server_resource(&path, "return 1"))
      })
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.data.path, "app/main.lua");

    // Second request is served from the cache without fetching
    let result = cache
      .resolve("/app/main.lua", true, |_| async { Err(eyre!("not expected")) })
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Cache);
    assert_eq!(result.data.content, b"return 1");
  }

  #[tokio::test]
  async fn test_fallback_offline_uses_cache_only() {
    let cache = cache();
    let result = cache
      .resolve("app/main.lua", false, |path| async move {
        Ok(server_resource(&path, "x"))
      })
      .await;
    assert!(result.is_err());

    cache
      .storage()
      .put(&server_resource("app/main.lua", "cached"))
      .unwrap();
    let result = cache
      .resolve("app/main.lua", false, |_| async { Err(eyre!("not expected")) })
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_local_only_never_fetches() {
    let cache = cache();
    let result = cache
      .resolve("/local/app/main.lua", true, |path| async move {
        Ok(server_resource(&path, "x"))
      })
      .await;
    assert!(result.is_err());

    cache
      .storage()
      .put(&server_resource("app/main.lua", "cached"))
      .unwrap();
    let result = cache
      .resolve("/local/app/main.lua", false, |_| async { Err(eyre!("not expected")) })
      .await
      .unwrap();
    assert_eq!(result.data.content, b"cached");
  }

  #[tokio::test]
  async fn test_remote_only_bypasses_cache() {
    let cache = cache();
    cache
      .storage()
      .put(&server_resource("info.xml", "cached"))
      .unwrap();

    let result = cache
      .resolve("/remote/info.xml", true, |path| async move {
        Ok(server_resource(&path, "fresh"))
      })
      .await
      .unwrap();
    assert_eq!(result.data.content, b"fresh");
    assert_eq!(cache.storage().get("info.xml").unwrap().unwrap().content, b"cached");
    assert!(cache.lookup("/remote/info.xml").unwrap().is_none());

    let offline = cache
      .resolve("/remote/info.xml", false, |path| async move {
        Ok(server_resource(&path, "fresh"))
      })
      .await;
    assert!(offline.is_err());
  }

  #[tokio::test]
  async fn test_refresh_only_fetches_changed_entries() {
    let cache = cache();
    cache
      .storage()
      .put(&server_resource("same.txt", "12345"))
      .unwrap();
    cache
      .storage()
      .put(&server_resource("changed.txt", "old"))
      .unwrap();

    let fetched = AtomicUsize::new(0);
    let report = cache
      .refresh(
        &[
          listing("/same.txt", 5),
          listing("/changed.txt", 7),
          listing("/new.txt", 3),
        ],
        |path| {
          fetched.fetch_add(1, Ordering::SeqCst);
          let body = if path == "changed.txt" { "changed" } else { "new" };
          async move { Ok(server_resource(&path, body)) }
        },
      )
      .await
      .unwrap();

    assert_eq!(
      report,
      RefreshReport {
        updated: 2,
        unchanged: 1,
        failed: 0
      }
    );
    assert_eq!(fetched.load(Ordering::SeqCst), 2);
    assert_eq!(cache.storage().get("changed.txt").unwrap().unwrap().content, b"changed");
    assert!(!cache.needs_refresh(&listing("new.txt", 3)).unwrap());
  }

  #[tokio::test]
  async fn test_refresh_continues_after_failed_fetch() {
    let cache = cache();

    let report = cache
      .refresh(&[listing("broken.txt", 4), listing("ok.txt", 2)], |path| async move {
        if path == "broken.txt" {
          Err(eyre!("connection reset"))
        } else {
          Ok(server_resource(&path, "ok"))
        }
      })
      .await
      .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.updated, 1);
    assert!(cache.storage().get("broken.txt").unwrap().is_none());
    assert!(cache.storage().get("ok.txt").unwrap().is_some());
  }

  #[test]
  fn test_needs_refresh_on_new_write_time() {
    let cache = cache();
    cache
      .storage()
      .put(&server_resource("a.txt", "abc"))
      .unwrap();

    assert!(!cache.needs_refresh(&listing("a.txt", 3)).unwrap());

    let mut newer = listing("a.txt", 3);
    newer.last_write_time = written() + chrono::Duration::seconds(1);
    assert!(cache.needs_refresh(&newer).unwrap());
  }
}
