//! Offline resource cache.
//!
//! Web resources of an environment (scripts, templates, images) are kept in
//! the local store so the client keeps working without a server:
//! - Request paths are routed by prefix: `/local/`, `/remote/`, or cache-first
//! - Cached rows carry content type, charset and length/write time
//! - Textual payloads are stored gzip-compressed
//! - A refresh compares the server's directory listing and refetches what changed

mod layer;
mod storage;
mod traits;

pub use layer::ResourceCache;
pub use storage::{CacheStorage, SqliteStorage, DEFAULT_COMPRESS_THRESHOLD};
pub use traits::{CacheResult, CacheSource, RefreshReport, RemoteFileInfo, Resource, ResourceRoute};
