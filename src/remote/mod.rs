//! Contract with the backend service.

mod http;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
use types::{Agent, ChatMessage, Memory, MemoryNode, NewMemoryNode};

pub use http::HttpRemoteClient;

/// Authenticated calls to the remote service, one per entity operation.
///
/// Implementations classify every failure into an [`crate::Error`] variant;
/// callers rely on that classification to decide between queueing, giving
/// up, and asking for re-pairing.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  async fn list_agents(&self) -> Result<Vec<Agent>>;

  /// Apply a care interaction ("feed", "play", ...) and return the updated agent
  async fn care_agent(&self, agent_id: &str, action: &str) -> Result<Agent>;

  async fn list_messages(&self, agent_id: &str) -> Result<Vec<ChatMessage>>;

  async fn send_message(&self, agent_id: &str, content: &str) -> Result<ChatMessage>;

  async fn list_memories(&self, agent_id: &str) -> Result<Vec<Memory>>;

  async fn set_memory(&self, agent_id: &str, key: &str, value: &str) -> Result<Memory>;

  async fn delete_memory(&self, agent_id: &str, key: &str) -> Result<()>;

  async fn list_memory_nodes(&self, agent_id: &str) -> Result<Vec<MemoryNode>>;

  async fn create_memory_node(&self, agent_id: &str, node: &NewMemoryNode) -> Result<MemoryNode>;

  async fn delete_memory_node(&self, agent_id: &str, node_id: &str) -> Result<()>;

  /// Drop any stored credential. Called when the device is unpaired.
  fn forget_credentials(&self) {}
}
