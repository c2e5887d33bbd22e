//! Offline object store and synchronization for PPSn environments.
//!
//! An [`Environment`](environment::Environment) owns one local SQLite store
//! holding cached business objects with their tags and links, plus the
//! offline copies of the server's web resources.

pub mod cache;
pub mod config;
pub mod db;
pub mod environment;
pub mod objects;
pub mod remote;
