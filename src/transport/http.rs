use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::Transport;
use crate::cache::Method;
use crate::config::{ApiConfig, Config};
use crate::error::TransportError;

/// reqwest-backed API client
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(api: &ApiConfig) -> Result<Self> {
    // Url::join replaces the last segment unless the base ends with '/'
    let mut base = api.base_url.trim_end_matches('/').to_string();
    base.push('/');
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL {}: {}", api.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(api.timeout_secs))
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::get_api_token().ok(),
    })
  }

  fn url(&self, path: &str) -> std::result::Result<Url, TransportError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| TransportError::Network(format!("invalid path {}: {}", path, e)))
  }
}

impl Transport for HttpTransport {
  async fn request(
    &self,
    method: Method,
    path: &str,
    query: &[(String, String)],
    body: Option<&Value>,
  ) -> std::result::Result<Value, TransportError> {
    let url = self.url(path)?;
    let method = match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut request = self.client.request(method, url).query(query);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
      return Err(TransportError::Unauthorized);
    }
    if !status.is_success() {
      let message = response.text().await.unwrap_or_default();
      return Err(TransportError::Status {
        status: status.as_u16(),
        message,
      });
    }

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
  }
}
