use serde::{Deserialize, Serialize};

/// Prefix for ids generated on the device before the server has assigned one
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Generate a provisional id for an item created on this device.
pub fn provisional_id() -> String {
  format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4())
}

/// Whether the id was generated locally and has not been replaced yet.
pub fn is_provisional(id: &str) -> bool {
  id.starts_with(PROVISIONAL_PREFIX)
}

/// Agent directory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub persona: Option<String>,
  #[serde(default)]
  pub mood: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// One message of an agent's chat history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
  pub id: String,
  pub agent_id: String,
  pub role: String, // "user" or "agent"
  pub content: String,
  #[serde(default)]
  pub created_at: Option<String>,
}

/// Key/value memory attached to an agent. The key is the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
  pub key: String,
  pub value: String,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Semantic memory node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNode {
  pub id: String,
  pub content: String,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub importance: Option<f32>,
  #[serde(default)]
  pub created_at: Option<String>,
}

/// Fields needed to create a memory node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemoryNode {
  pub content: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub importance: Option<f32>,
}
