use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

use super::types::{Agent, ChatMessage, Memory, MemoryNode, NewMemoryNode};
use super::RemoteClient;
use crate::config::RemoteConfig;
use crate::error::{Error, Result};

/// Longest error body echoed back into an error message
const MAX_ERROR_BODY: usize = 200;

/// List endpoints answer either with a bare array or with `{"items": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ApiList<T> {
  Bare(Vec<T>),
  Wrapped { items: Vec<T> },
}

impl<T> ApiList<T> {
  fn into_vec(self) -> Vec<T> {
    match self {
      ApiList::Bare(items) => items,
      ApiList::Wrapped { items } => items,
    }
  }
}

/// REST client for the agent service.
///
/// The bearer token is shared between clones. A 401/403 answer clears it, and
/// every later call fails with [`Error::Unauthorized`] until a new token is set.
#[derive(Clone)]
pub struct HttpRemoteClient {
  http: reqwest::Client,
  base_url: Url,
  token: Arc<RwLock<Option<String>>>,
}

impl HttpRemoteClient {
  pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| Error::Config(format!("Invalid base URL {}: {}", config.base_url, e)))?;
    if base_url.cannot_be_a_base() {
      return Err(Error::Config(format!(
        "Base URL {} cannot carry a path",
        config.base_url
      )));
    }

    let http = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base_url,
      token: Arc::new(RwLock::new(token)),
    })
  }

  /// Install a fresh credential (after re-pairing).
  pub fn set_token(&self, token: String) {
    if let Ok(mut slot) = self.token.write() {
      *slot = Some(token);
    }
  }

  /// Forget the current credential.
  pub fn invalidate_token(&self) {
    if let Ok(mut slot) = self.token.write() {
      if slot.take().is_some() {
        tracing::warn!("Remote credential invalidated; re-pairing required");
      }
    }
  }

  pub fn has_token(&self) -> bool {
    self.token.read().map(|t| t.is_some()).unwrap_or(false)
  }

  fn bearer(&self) -> Result<String> {
    self
      .token
      .read()
      .ok()
      .and_then(|t| t.clone())
      .ok_or_else(|| Error::Unauthorized("No credential; pair the device first".to_string()))
  }

  fn endpoint(&self, segments: &[&str]) -> Result<Url> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| Error::Config(format!("Base URL {} cannot carry a path", self.base_url)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
    Ok(request.bearer_auth(self.bearer()?))
  }

  /// Send and decode a JSON body.
  async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
    let response = self.dispatch(request).await?;
    response.json::<T>().await.map_err(classify)
  }

  /// Send and discard the body. 404 counts as success: the thing is already gone.
  async fn call_delete(&self, request: RequestBuilder) -> Result<()> {
    match self.dispatch(request).await {
      Ok(_) => Ok(()),
      Err(Error::Rejected { status: 404, .. }) => Ok(()),
      Err(e) => Err(e),
    }
  }

  async fn dispatch(&self, request: RequestBuilder) -> Result<Response> {
    let request = self.authorized(request)?;
    let response = request.send().await.map_err(classify)?;
    let status = response.status();

    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let error = classify_status(status, &body);
    if error.is_unauthorized() {
      self.invalidate_token();
    }
    Err(error)
  }
}

/// Map a non-success status onto the sync error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> Error {
  if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
    return Error::Unauthorized(format!("HTTP {}", status.as_u16()));
  }

  if status.is_server_error() {
    return Error::Server(status.as_u16());
  }

  let mut cut = body.len().min(MAX_ERROR_BODY);
  while !body.is_char_boundary(cut) {
    cut -= 1;
  }
  Error::Rejected {
    status: status.as_u16(),
    message: body[..cut].to_string(),
  }
}

/// Map a reqwest failure onto the sync error taxonomy.
fn classify(e: reqwest::Error) -> Error {
  if e.is_timeout() {
    Error::Timeout(e.to_string())
  } else if e.is_decode() {
    Error::Malformed(e.to_string())
  } else {
    Error::Network(e.to_string())
  }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
  async fn list_agents(&self) -> Result<Vec<Agent>> {
    let url = self.endpoint(&["agents"])?;
    let list: ApiList<Agent> = self.call(self.http.get(url)).await?;
    Ok(list.into_vec())
  }

  async fn care_agent(&self, agent_id: &str, action: &str) -> Result<Agent> {
    let url = self.endpoint(&["agents", agent_id, "care"])?;
    let body = serde_json::json!({ "action": action });
    self.call(self.http.post(url).json(&body)).await
  }

  async fn list_messages(&self, agent_id: &str) -> Result<Vec<ChatMessage>> {
    let url = self.endpoint(&["agents", agent_id, "messages"])?;
    let list: ApiList<ChatMessage> = self.call(self.http.get(url)).await?;
    Ok(list.into_vec())
  }

  async fn send_message(&self, agent_id: &str, content: &str) -> Result<ChatMessage> {
    let url = self.endpoint(&["agents", agent_id, "messages"])?;
    let body = serde_json::json!({ "content": content });
    self.call(self.http.post(url).json(&body)).await
  }

  async fn list_memories(&self, agent_id: &str) -> Result<Vec<Memory>> {
    let url = self.endpoint(&["agents", agent_id, "memories"])?;
    let list: ApiList<Memory> = self.call(self.http.get(url)).await?;
    Ok(list.into_vec())
  }

  async fn set_memory(&self, agent_id: &str, key: &str, value: &str) -> Result<Memory> {
    let url = self.endpoint(&["agents", agent_id, "memories", key])?;
    let body = serde_json::json!({ "value": value });
    self.call(self.http.put(url).json(&body)).await
  }

  async fn delete_memory(&self, agent_id: &str, key: &str) -> Result<()> {
    let url = self.endpoint(&["agents", agent_id, "memories", key])?;
    self.call_delete(self.http.delete(url)).await
  }

  async fn list_memory_nodes(&self, agent_id: &str) -> Result<Vec<MemoryNode>> {
    let url = self.endpoint(&["agents", agent_id, "memory-nodes"])?;
    let list: ApiList<MemoryNode> = self.call(self.http.get(url)).await?;
    Ok(list.into_vec())
  }

  async fn create_memory_node(&self, agent_id: &str, node: &NewMemoryNode) -> Result<MemoryNode> {
    let url = self.endpoint(&["agents", agent_id, "memory-nodes"])?;
    self.call(self.http.post(url).json(node)).await
  }

  async fn delete_memory_node(&self, agent_id: &str, node_id: &str) -> Result<()> {
    let url = self.endpoint(&["agents", agent_id, "memory-nodes", node_id])?;
    self.call_delete(self.http.delete(url)).await
  }

  fn forget_credentials(&self) {
    self.invalidate_token();
  }
}
