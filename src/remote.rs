//! Remote document API contract and its HTTP implementation.
//!
//! Every call resolves to a `RemoteResponse` envelope. Ordinary failures
//! (unreachable host, timeout, non-2xx status, undecodable body) are reported
//! inside the envelope and never as a Rust error.

use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::config::{Config, ServerConfig};

/// HTTP verb for a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
}

/// A single request against the document API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCall {
  pub method: Method,
  pub path: String,
  /// Query parameters for GET, JSON body otherwise
  #[serde(default)]
  pub params: Value,
}

impl RemoteCall {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      path: path.into(),
      params: Value::Null,
    }
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self {
      method: Method::Post,
      path: path.into(),
      params: body,
    }
  }

  pub fn put(path: impl Into<String>, body: Value) -> Self {
    Self {
      method: Method::Put,
      path: path.into(),
      params: body,
    }
  }

  pub fn with_params(mut self, params: Value) -> Self {
    self.params = params;
    self
  }

  /// List every document of an entity type.
  pub fn list(entity_type: &str) -> Self {
    Self::get(resource_path(entity_type, None))
  }

  /// Fetch one document.
  pub fn document(entity_type: &str, name: &str) -> Self {
    Self::get(resource_path(entity_type, Some(name)))
  }

  pub fn create(entity_type: &str, body: Value) -> Self {
    Self::post(resource_path(entity_type, None), body)
  }

  pub fn update(entity_type: &str, name: &str, body: Value) -> Self {
    Self::put(resource_path(entity_type, Some(name)), body)
  }

  /// Count documents of an entity type.
  pub fn count(entity_type: &str) -> Self {
    Self::get("/api/method/frappe.client.get_count")
      .with_params(serde_json::json!({ "doctype": entity_type }))
  }
}

/// `/api/resource/<type>[/<name>]` with each segment percent-encoded, so a
/// name holding `/`, `?` or `#` still addresses that one document.
pub fn resource_path(entity_type: &str, name: Option<&str>) -> String {
  let mut path = format!("/api/resource/{}", encode_segment(entity_type));
  if let Some(name) = name {
    path.push('/');
    path.push_str(&encode_segment(name));
  }
  path
}

fn encode_segment(segment: &str) -> String {
  // Form encoding writes a space as `+` and a literal `+` as `%2B`.
  url::form_urlencoded::byte_serialize(segment.as_bytes())
    .collect::<String>()
    .replace('+', "%20")
}

/// Why a remote call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum RemoteErrorKind {
  /// Connection refused, DNS failure, TLS failure
  Unreachable,
  /// No response within the time budget
  Timeout,
  /// Server answered with a non-success status
  Server(u16),
  /// Server answered but the body did not match the expected shape
  Decode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
  pub kind: RemoteErrorKind,
  pub message: String,
}

impl RemoteError {
  pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  /// Whether the server was reached at all.
  pub fn is_transport(&self) -> bool {
    matches!(
      self.kind,
      RemoteErrorKind::Unreachable | RemoteErrorKind::Timeout
    )
  }
}

impl std::fmt::Display for RemoteError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.kind {
      RemoteErrorKind::Server(status) => write!(f, "HTTP {}: {}", status, self.message),
      _ => write!(f, "{}", self.message),
    }
  }
}

/// Uniform `{success, data|error}` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse<T> {
  pub success: bool,
  pub data: Option<T>,
  pub error: Option<RemoteError>,
}

impl<T> RemoteResponse<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      error: None,
    }
  }

  pub fn err(error: RemoteError) -> Self {
    Self {
      success: false,
      data: None,
      error: Some(error),
    }
  }

  /// Collapse the envelope into a `Result`.
  pub fn into_result(self) -> std::result::Result<T, RemoteError> {
    match (self.success, self.data, self.error) {
      (true, Some(data), _) => Ok(data),
      (_, _, Some(error)) => Err(error),
      (true, None, None) => Err(RemoteError::new(
        RemoteErrorKind::Decode,
        "response carried no data",
      )),
      (false, _, None) => Err(RemoteError::new(
        RemoteErrorKind::Decode,
        "request failed without an error message",
      )),
    }
  }
}

/// Performs authenticated calls against the document API.
pub trait RemoteClient: Send + Sync + 'static {
  fn request<T>(&self, call: RemoteCall) -> impl Future<Output = RemoteResponse<T>> + Send
  where
    T: DeserializeOwned + Send + 'static;
}

/// Document API client over HTTP.
#[derive(Clone)]
pub struct HttpRemoteClient {
  http: reqwest::Client,
  /// Unset in demo-only setups; every call then reports unreachable
  base: Option<Url>,
  token: Option<String>,
}

impl HttpRemoteClient {
  pub fn new(server: &ServerConfig, token: Option<String>) -> Result<Self> {
    let base = server
      .url
      .as_deref()
      .map(|url| Url::parse(url).map_err(|e| eyre!("Invalid server url {}: {}", url, e)))
      .transpose()?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_millis(server.request_timeout_ms))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base, token })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(&config.server, Config::get_api_token().ok())
  }

  async fn send(&self, call: &RemoteCall) -> std::result::Result<Value, RemoteError> {
    let base = self.base.as_ref().ok_or_else(|| {
      RemoteError::new(RemoteErrorKind::Unreachable, "server.url is not configured")
    })?;
    let url = base
      .join(call.path.trim_start_matches('/'))
      .map_err(|e| RemoteError::new(RemoteErrorKind::Unreachable, format!("bad path: {}", e)))?;

    let mut request = match call.method {
      Method::Get => {
        let query = query_pairs(&call.params);
        self.http.get(url).query(&query)
      }
      Method::Post => self.http.post(url).json(&call.params),
      Method::Put => self.http.put(url).json(&call.params),
    };
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    let body = response.text().await.map_err(classify)?;

    if !status.is_success() {
      return Err(RemoteError::new(
        RemoteErrorKind::Server(status.as_u16()),
        server_message(status, &body),
      ));
    }

    let value: Value = serde_json::from_str(&body)
      .map_err(|e| RemoteError::new(RemoteErrorKind::Decode, e.to_string()))?;
    Ok(unwrap_document(value))
  }
}

impl RemoteClient for HttpRemoteClient {
  async fn request<T>(&self, call: RemoteCall) -> RemoteResponse<T>
  where
    T: DeserializeOwned + Send + 'static,
  {
    match self.send(&call).await {
      Ok(value) => match serde_json::from_value(value) {
        Ok(data) => RemoteResponse::ok(data),
        Err(e) => RemoteResponse::err(RemoteError::new(RemoteErrorKind::Decode, e.to_string())),
      },
      Err(error) => {
        tracing::debug!(path = %call.path, %error, "remote call failed");
        RemoteResponse::err(error)
      }
    }
  }
}

fn classify(e: reqwest::Error) -> RemoteError {
  let kind = if e.is_timeout() {
    RemoteErrorKind::Timeout
  } else if let Some(status) = e.status() {
    RemoteErrorKind::Server(status.as_u16())
  } else if e.is_decode() {
    RemoteErrorKind::Decode
  } else {
    RemoteErrorKind::Unreachable
  };
  RemoteError::new(kind, e.to_string())
}

/// Flatten a JSON object into query pairs; nested values are sent as JSON text.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
  match params {
    Value::Object(map) => map
      .iter()
      .map(|(k, v)| {
        let v = match v {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        (k.clone(), v)
      })
      .collect(),
    _ => Vec::new(),
  }
}

/// The document API wraps payloads in `data` (resources) or `message` (methods).
fn unwrap_document(value: Value) -> Value {
  match value {
    Value::Object(mut map) => {
      if let Some(data) = map.remove("data") {
        data
      } else if let Some(message) = map.remove("message") {
        message
      } else {
        Value::Object(map)
      }
    }
    other => other,
  }
}

fn server_message(status: StatusCode, body: &str) -> String {
  serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| {
      ["exception", "message", "exc_type"]
        .iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str).map(String::from))
    })
    .unwrap_or_else(|| {
      status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
    })
}
