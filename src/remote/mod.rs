pub mod api_types;
pub mod client;
#[cfg(test)]
pub(crate) mod test_server;

pub use api_types::{LoginInfo, ServerInfo};
pub use client::RemoteClient;
