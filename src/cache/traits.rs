//! Core types for the offline resource cache.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A cached web resource (scripts, templates, images served by the
/// environment's server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
  /// Relative path used as the cache key, without leading slash
  pub path: String,
  pub content_type: String,
  pub charset: Option<String>,
  /// Uncompressed payload
  pub content: Vec<u8>,
  pub last_write_time: DateTime<Utc>,
}

impl Resource {
  pub fn length(&self) -> u64 {
    self.content.len() as u64
  }
}

/// One entry of the server's resource directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileInfo {
  pub path: String,
  pub length: u64,
  pub last_write_time: DateTime<Utc>,
}

/// How a request path is resolved, chosen by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRoute {
  /// `/local/...`: served from the cache only
  LocalOnly,
  /// `/remote/...`: always fetched, never stored
  RemoteOnly,
  /// Anything else: cache first, fetch and store on a miss
  CacheWithOnlineFallback,
}

impl ResourceRoute {
  const LOCAL_PREFIX: &'static str = "/local/";
  const REMOTE_PREFIX: &'static str = "/remote/";

  /// Split a request path into its route and the normalized cache key.
  pub fn split(request_path: &str) -> (Self, String) {
    let path = request_path.replace('\\', "/");
    let (route, rest) = if let Some(rest) = path.strip_prefix(Self::LOCAL_PREFIX) {
      (Self::LocalOnly, rest)
    } else if let Some(rest) = path.strip_prefix(Self::REMOTE_PREFIX) {
      (Self::RemoteOnly, rest)
    } else {
      (Self::CacheWithOnlineFallback, path.as_str())
    };
    (route, normalize_path(rest))
  }
}

/// Cache keys are relative: no leading slash, no empty segments.
pub fn normalize_path(path: &str) -> String {
  path
    .replace('\\', "/")
    .split('/')
    .filter(|segment| !segment.is_empty())
    .collect::<Vec<_>>()
    .join("/")
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  /// Served from the cache because the network fetch failed.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from the local cache
  Cache,
  /// Network unavailable or failing, serving cached data
  Offline,
}

/// Outcome of refreshing the cache against a directory listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
  pub updated: usize,
  pub unchanged: usize,
  pub failed: usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_route_prefixes() {
    assert_eq!(
      ResourceRoute::split("/local/app/main.lua"),
      (ResourceRoute::LocalOnly, "app/main.lua".to_string())
    );
    assert_eq!(
      ResourceRoute::split("/remote/info.xml"),
      (ResourceRoute::RemoteOnly, "info.xml".to_string())
    );
    assert_eq!(
      ResourceRoute::split("/wpf/templates.xaml"),
      (ResourceRoute::CacheWithOnlineFallback, "wpf/templates.xaml".to_string())
    );
  }

  #[test]
  fn test_normalize_path() {
    assert_eq!(normalize_path("//a\\b//c.txt"), "a/b/c.txt");
    assert_eq!(normalize_path("a/b"), "a/b");
    assert_eq!(normalize_path("/"), "");
  }

  #[test]
  fn test_local_prefix_requires_trailing_slash() {
    let (route, path) = ResourceRoute::split("/localfile.txt");
    assert_eq!(route, ResourceRoute::CacheWithOnlineFallback);
    assert_eq!(path, "localfile.txt");
  }
}
