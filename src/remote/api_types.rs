//! Serde types matching the server's JSON responses.
//!
//! Kept apart from the domain types in `objects` so the wire format can
//! change without touching the store.

use color_eyre::{eyre::WrapErr, Result};
use serde::Deserialize;
use uuid::Uuid;

use crate::cache::RemoteFileInfo;
use crate::objects::{IncomingLink, LinkOnDelete, ObjectTag, ServerObjectRow, TagClass};

/// Answer of `action=login`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInfo {
  pub user_id: i64,
  pub user_name: String,
  pub display_name: Option<String>,
}

/// Answer of `action=info`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
  pub version: String,
  /// Resource directory listing used to refresh the offline cache
  #[serde(default)]
  pub files: Vec<RemoteFileInfo>,
}

// ============================================================================
// Object list view (action=viewget&v=objects)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiViewResponse {
  #[serde(default)]
  pub rows: Vec<ApiObjectRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTag {
  pub key: String,
  #[serde(default)]
  pub class: i64,
  pub value: Option<String>,
  #[serde(default)]
  pub sync_token: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLink {
  /// Server id of the linked object
  pub id: i64,
  pub guid: Uuid,
  #[serde(default)]
  pub on_delete: String,
  #[serde(default)]
  pub sync_token: i64,
  #[serde(default)]
  pub removed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiObjectRow {
  pub id: i64,
  pub guid: Uuid,
  pub typ: String,
  pub nr: Option<String>,
  pub mime_type: Option<String>,
  #[serde(default)]
  pub is_rev: bool,
  pub rev_id: Option<i64>,
  #[serde(default)]
  pub sync_token: i64,
  #[serde(default)]
  pub tags: Vec<ApiTag>,
  #[serde(default)]
  pub links: Vec<ApiLink>,
}

impl ApiObjectRow {
  pub fn into_row(self) -> Result<ServerObjectRow> {
    let guid = self.guid;
    let tags = self
      .tags
      .into_iter()
      .map(|t| {
        Ok(ObjectTag {
          class: TagClass::from_code(t.class)?,
          key: t.key,
          value: t.value,
          sync_token: t.sync_token,
        })
      })
      .collect::<Result<Vec<_>>>()
      .wrap_err_with(|| format!("Invalid tag on object {}", guid))?;
    let links = self
      .links
      .into_iter()
      .map(|l| {
        Ok(IncomingLink {
          server_id: l.id,
          guid: l.guid,
          on_delete: LinkOnDelete::from_code(&l.on_delete)?,
          sync_token: l.sync_token,
          removed: l.removed,
        })
      })
      .collect::<Result<Vec<_>>>()
      .wrap_err_with(|| format!("Invalid link on object {}", guid))?;

    Ok(ServerObjectRow {
      id: self.id,
      guid,
      typ: self.typ,
      nr: self.nr,
      mime_type: self.mime_type,
      is_rev: self.is_rev,
      rev_id: self.rev_id,
      sync_token: self.sync_token,
      tags,
      links,
    })
  }
}
