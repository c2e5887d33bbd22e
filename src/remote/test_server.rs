//! Minimal HTTP/1.1 server for exercising the client against canned
//! responses.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub struct StubResponse {
  pub status: u16,
  pub headers: Vec<(&'static str, String)>,
  pub body: Vec<u8>,
}

impl StubResponse {
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self {
      status: 200,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn status(status: u16) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn header(mut self, name: &'static str, value: &str) -> Self {
    self.headers.push((name, value.to_string()));
    self
  }

  fn to_bytes(&self) -> Vec<u8> {
    let mut head = format!(
      "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n",
      self.status,
      self.body.len()
    );
    for (name, value) in &self.headers {
      head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&self.body);
    bytes
  }
}

/// Serve every connection with `handler`, which receives the request
/// target (path and query). Returns the base url `http://127.0.0.1:<port>/ppsn/`.
pub async fn serve<F>(handler: F) -> String
where
  F: Fn(&str) -> StubResponse + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handler = Arc::new(handler);

  tokio::spawn(async move {
    while let Ok((mut socket, _)) = listener.accept().await {
      let handler = Arc::clone(&handler);
      tokio::spawn(async move {
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
          match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&chunk[..n]),
          }
        }

        let request = String::from_utf8_lossy(&request);
        let target = request.split_whitespace().nth(1).unwrap_or("/").to_string();
        let response = handler(&target);
        let _ = socket.write_all(&response.to_bytes()).await;
        let _ = socket.shutdown().await;
      });
    }
  });

  format!("http://{}/ppsn/", addr)
}

/// Value of a query parameter in a request target.
pub fn query_param(target: &str, name: &str) -> Option<String> {
  let url = url::Url::parse(&format!("http://stub{}", target)).ok()?;
  url
    .query_pairs()
    .find(|(key, _)| key == name)
    .map(|(_, value)| value.into_owned())
}
