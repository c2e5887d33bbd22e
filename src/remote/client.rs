use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, CONTENT_TYPE, LAST_MODIFIED};
use reqwest::Response;
use tracing::debug;
use url::Url;

use crate::cache::Resource;
use crate::config::Config;
use crate::objects::{PulledDocument, ServerObjectRow};
use crate::remote::api_types::{ApiViewResponse, LoginInfo, ServerInfo};

/// Response header carrying the revision a pull delivered.
pub const PULLED_REVISION_HEADER: &str = "ppsn-pulled-revid";

/// HTTP client for the environment's server.
#[derive(Clone)]
pub struct RemoteClient {
  http: reqwest::Client,
  base: Url,
  user: String,
  password: String,
}

impl RemoteClient {
  pub fn new(config: &Config) -> Result<Self> {
    let password = Config::get_password()?;
    Self::connect(&config.environment.url, &config.environment.user, password)
  }

  pub fn connect(url: &str, user: &str, password: String) -> Result<Self> {
    let base = base_url(url)?;
    let http = reqwest::Client::builder()
      .gzip(true)
      .user_agent(concat!("ppsn-offline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      user: user.to_string(),
      password,
    })
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// `{base}?action=...` with extra query parameters.
  pub fn action_url(&self, action: &str, params: &[(&str, String)]) -> Url {
    let mut url = self.base.clone();
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("action", action);
      for (key, value) in params {
        query.append_pair(key, value);
      }
    }
    url
  }

  /// Absolute URL of a resource path relative to the base.
  pub fn resource_url(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid resource path {}: {}", path, e))
  }

  async fn get(&self, url: Url) -> Result<Response> {
    debug!(url = %url, "GET");
    let response = self
      .http
      .get(url.clone())
      .basic_auth(&self.user, Some(&self.password))
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Request to {} failed with status {}", url, status));
    }
    Ok(response)
  }

  async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
    let body = self
      .get(url.clone())
      .await?
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;
    serde_json::from_slice(&body).map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  /// Check the credentials.
  pub async fn login(&self) -> Result<LoginInfo> {
    self.get_json(self.action_url("login", &[])).await
  }

  pub async fn server_info(&self) -> Result<ServerInfo> {
    self.get_json(self.action_url("info", &[])).await
  }

  /// One page of the server's object list view. Rows are converted one by
  /// one, so a malformed row does not hide the rest of the page.
  pub async fn list_objects(
    &self,
    filter: Option<&str>,
    start: usize,
    count: usize,
  ) -> Result<Vec<Result<ServerObjectRow>>> {
    let mut params = vec![("v", "objects".to_string())];
    if let Some(filter) = filter {
      params.push(("f", filter.to_string()));
    }
    params.push(("s", start.to_string()));
    params.push(("c", count.to_string()));

    let response: ApiViewResponse = self.get_json(self.action_url("viewget", &params)).await?;
    Ok(response.rows.into_iter().map(|row| row.into_row()).collect())
  }

  /// Download an object's document, the head revision unless `rev_id` is
  /// given.
  pub async fn pull(&self, server_id: i64, rev_id: Option<i64>) -> Result<PulledDocument> {
    let mut params = vec![("id", server_id.to_string())];
    if let Some(rev) = rev_id {
      params.push(("rev", rev.to_string()));
    }
    let url = self.action_url("pull", &params);
    let response = self.get(url.clone()).await?;

    let headers = response.headers();
    let mime_type = header_str(headers, CONTENT_TYPE.as_str()).map(|v| parse_content_type(v).0);
    let rev_id = match header_str(headers, PULLED_REVISION_HEADER) {
      Some(value) => Some(
        value
          .trim()
          .parse::<i64>()
          .map_err(|e| eyre!("Invalid {} header '{}' from {}: {}", PULLED_REVISION_HEADER, value, url, e))?,
      ),
      None => rev_id,
    };

    let content = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read document from {}: {}", url, e))?
      .to_vec();

    Ok(PulledDocument {
      content,
      mime_type,
      rev_id,
    })
  }

  /// Fetch a resource for the offline cache.
  pub async fn get_resource(&self, path: &str) -> Result<Resource> {
    let url = self.resource_url(path)?;
    let response = self.get(url.clone()).await?;

    let headers = response.headers();
    let (content_type, charset) = header_str(headers, CONTENT_TYPE.as_str())
      .map(parse_content_type)
      .unwrap_or_else(|| ("application/octet-stream".to_string(), None));
    let last_write_time = header_str(headers, LAST_MODIFIED.as_str())
      .and_then(parse_http_date)
      .unwrap_or_else(Utc::now);

    let content = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read resource from {}: {}", url, e))?
      .to_vec();

    Ok(Resource {
      path: path.to_string(),
      content_type,
      charset,
      content,
      last_write_time,
    })
  }
}

fn base_url(url: &str) -> Result<Url> {
  let mut base = Url::parse(url).map_err(|e| eyre!("Invalid server url {}: {}", url, e))?;
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  base.set_query(None);
  Ok(base)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
  headers.get(name).and_then(|v| v.to_str().ok())
}

/// Split `text/html; charset=utf-8` into the media type and charset.
pub fn parse_content_type(value: &str) -> (String, Option<String>) {
  let mut parts = value.split(';');
  let media_type = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
  let charset = parts.find_map(|p| {
    let (key, value) = p.split_once('=')?;
    key
      .trim()
      .eq_ignore_ascii_case("charset")
      .then(|| value.trim().trim_matches('"').to_string())
  });
  (media_type, charset)
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc2822(value)
    .ok()
    .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::test_server::{query_param, serve, StubResponse};

  fn client() -> RemoteClient {
    RemoteClient::connect("https://ppsn.example.com/test", "alice", "secret".into()).unwrap()
  }

  #[test]
  fn test_base_url_gets_trailing_slash() {
    assert_eq!(client().base().as_str(), "https://ppsn.example.com/test/");
    assert!(RemoteClient::connect("not a url", "alice", String::new()).is_err());
  }

  #[test]
  fn test_action_url_encodes_parameters() {
    let url = client().action_url(
      "viewget",
      &[("v", "objects".into()), ("f", "typ = invoice & nr:R1".into())],
    );
    assert_eq!(
      url.as_str(),
      "https://ppsn.example.com/test/?action=viewget&v=objects&f=typ+%3D+invoice+%26+nr%3AR1"
    );
  }

  #[test]
  fn test_resource_url_is_relative_to_base() {
    let url = client().resource_url("/wpf/main.lua").unwrap();
    assert_eq!(url.as_str(), "https://ppsn.example.com/test/wpf/main.lua");
  }

  #[test]
  fn test_parse_content_type() {
    assert_eq!(
      parse_content_type("Text/HTML; charset=\"UTF-8\""),
      ("text/html".to_string(), Some("UTF-8".to_string()))
    );
    assert_eq!(parse_content_type("image/png"), ("image/png".to_string(), None));
  }

  #[test]
  fn test_parse_http_date() {
    let date = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
    assert_eq!(date.timestamp(), 1445412480);
    assert!(parse_http_date("yesterday").is_none());
  }

  #[tokio::test]
  async fn test_error_status_is_an_error() {
    let url = serve(|_| StubResponse::status(404)).await;
    let client = RemoteClient::connect(&url, "alice", "secret".into()).unwrap();

    let err = client.login().await.unwrap_err();
    assert!(err.to_string().contains("404"));
    assert!(client.get_resource("/wpf/main.lua").await.is_err());
    assert!(client.pull(5, None).await.is_err());
  }

  #[tokio::test]
  async fn test_pull_reads_revision_header() {
    let url = serve(|target| {
      assert_eq!(query_param(target, "action").as_deref(), Some("pull"));
      assert_eq!(query_param(target, "id").as_deref(), Some("5"));
      StubResponse::ok("document body")
        .header("Content-Type", "text/plain; charset=utf-8")
        .header(PULLED_REVISION_HEADER, "7")
    })
    .await;
    let client = RemoteClient::connect(&url, "alice", "secret".into()).unwrap();

    let document = client.pull(5, None).await.unwrap();
    assert_eq!(document.content, b"document body");
    assert_eq!(document.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(document.rev_id, Some(7));
  }

  #[tokio::test]
  async fn test_pull_keeps_requested_revision_without_header() {
    let url = serve(|_| StubResponse::ok("old")).await;
    let client = RemoteClient::connect(&url, "alice", "secret".into()).unwrap();

    let document = client.pull(5, Some(3)).await.unwrap();
    assert_eq!(document.rev_id, Some(3));
    assert!(document.mime_type.is_none());
  }

  #[tokio::test]
  async fn test_get_resource_uses_response_headers() {
    let url = serve(|target| {
      assert_eq!(target, "/ppsn/wpf/main.html");
      StubResponse::ok("<html/>")
        .header("Content-Type", "Text/HTML; charset=utf-8")
        .header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
    })
    .await;
    let client = RemoteClient::connect(&url, "alice", "secret".into()).unwrap();

    let resource = client.get_resource("/wpf/main.html").await.unwrap();
    assert_eq!(resource.path, "/wpf/main.html");
    assert_eq!(resource.content_type, "text/html");
    assert_eq!(resource.charset.as_deref(), Some("utf-8"));
    assert_eq!(resource.content, b"<html/>");
    assert_eq!(resource.last_write_time.timestamp(), 1445412480);
  }

  #[tokio::test]
  async fn test_list_objects_converts_rows_individually() {
    let url = serve(|target| {
      assert_eq!(query_param(target, "v").as_deref(), Some("objects"));
      assert_eq!(query_param(target, "s").as_deref(), Some("0"));
      assert_eq!(query_param(target, "c").as_deref(), Some("10"));
      StubResponse::ok(
        r#"{ "rows": [
          { "id": 1, "guid": "00000000-0000-0000-0000-000000000001", "typ": "invoice" },
          { "id": 2, "guid": "00000000-0000-0000-0000-000000000002", "typ": "invoice",
            "tags": [{ "key": "k", "class": 9 }] }
        ] }"#,
      )
    })
    .await;
    let client = RemoteClient::connect(&url, "alice", "secret".into()).unwrap();

    let rows = client.list_objects(None, 0, 10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].as_ref().unwrap().id, 1);
    assert!(rows[1].is_err());
  }
}
