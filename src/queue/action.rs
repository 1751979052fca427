//! Queued write operations and their payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::Cacheable;
use crate::error::{Error, Result};
use crate::remote::types::{Agent, ChatMessage, Memory, MemoryNode, NewMemoryNode};

/// Closed set of operations the offline queue can replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
  WriteCare,
  SendMessage,
  WriteMemory,
  DeleteMemory,
  WriteNote,
  DeleteNote,
}

impl ActionType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ActionType::WriteCare => "write-care",
      ActionType::SendMessage => "send-message",
      ActionType::WriteMemory => "write-memory",
      ActionType::DeleteMemory => "delete-memory",
      ActionType::WriteNote => "write-note",
      ActionType::DeleteNote => "delete-note",
    }
  }
}

impl fmt::Display for ActionType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ActionType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "write-care" => Ok(ActionType::WriteCare),
      "send-message" => Ok(ActionType::SendMessage),
      "write-memory" => Ok(ActionType::WriteMemory),
      "delete-memory" => Ok(ActionType::DeleteMemory),
      "write-note" => Ok(ActionType::WriteNote),
      "delete-note" => Ok(ActionType::DeleteNote),
      other => Err(Error::Corrupt(format!("Unknown action type '{}'", other))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarePayload {
  pub agent_id: String,
  pub action: String, // e.g. "feed", "play"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
  /// Provisional id of the optimistic message row
  pub local_id: String,
  pub agent_id: String,
  pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteMemoryPayload {
  pub agent_id: String,
  pub key: String,
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteMemoryPayload {
  pub agent_id: String,
  pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteNotePayload {
  /// Provisional id of the optimistic node row
  pub local_id: String,
  pub agent_id: String,
  pub node: NewMemoryNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNotePayload {
  pub agent_id: String,
  /// Server id, or a provisional id if the node was created offline
  pub node_id: String,
}

/// A decoded queued operation. Each variant carries everything needed to
/// replay it without looking at any other queued action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
  WriteCare(CarePayload),
  SendMessage(SendMessagePayload),
  WriteMemory(WriteMemoryPayload),
  DeleteMemory(DeleteMemoryPayload),
  WriteNote(WriteNotePayload),
  DeleteNote(DeleteNotePayload),
}

impl Action {
  pub fn action_type(&self) -> ActionType {
    match self {
      Action::WriteCare(_) => ActionType::WriteCare,
      Action::SendMessage(_) => ActionType::SendMessage,
      Action::WriteMemory(_) => ActionType::WriteMemory,
      Action::DeleteMemory(_) => ActionType::DeleteMemory,
      Action::WriteNote(_) => ActionType::WriteNote,
      Action::DeleteNote(_) => ActionType::DeleteNote,
    }
  }

  /// The agent the action belongs to. All entity scopes are per agent except
  /// the agent directory itself.
  pub fn agent_id(&self) -> &str {
    match self {
      Action::WriteCare(p) => &p.agent_id,
      Action::SendMessage(p) => &p.agent_id,
      Action::WriteMemory(p) => &p.agent_id,
      Action::DeleteMemory(p) => &p.agent_id,
      Action::WriteNote(p) => &p.agent_id,
      Action::DeleteNote(p) => &p.agent_id,
    }
  }

  /// Cached collection the action changes, as entity type and scope.
  pub fn target(&self) -> (&'static str, &str) {
    match self {
      Action::WriteCare(_) => (Agent::entity_type(), ""),
      Action::SendMessage(p) => (ChatMessage::entity_type(), &p.agent_id),
      Action::WriteMemory(p) => (Memory::entity_type(), &p.agent_id),
      Action::DeleteMemory(p) => (Memory::entity_type(), &p.agent_id),
      Action::WriteNote(p) => (MemoryNode::entity_type(), &p.agent_id),
      Action::DeleteNote(p) => (MemoryNode::entity_type(), &p.agent_id),
    }
  }

  /// Serialize the payload for storage.
  pub fn encode_payload(&self) -> Result<String> {
    let json = match self {
      Action::WriteCare(p) => serde_json::to_string(p),
      Action::SendMessage(p) => serde_json::to_string(p),
      Action::WriteMemory(p) => serde_json::to_string(p),
      Action::DeleteMemory(p) => serde_json::to_string(p),
      Action::WriteNote(p) => serde_json::to_string(p),
      Action::DeleteNote(p) => serde_json::to_string(p),
    }?;
    Ok(json)
  }

  /// Rebuild an action from its stored type tag and payload.
  pub fn decode(action_type: ActionType, payload: &str) -> Result<Self> {
    let action = match action_type {
      ActionType::WriteCare => Action::WriteCare(serde_json::from_str(payload)?),
      ActionType::SendMessage => Action::SendMessage(serde_json::from_str(payload)?),
      ActionType::WriteMemory => Action::WriteMemory(serde_json::from_str(payload)?),
      ActionType::DeleteMemory => Action::DeleteMemory(serde_json::from_str(payload)?),
      ActionType::WriteNote => Action::WriteNote(serde_json::from_str(payload)?),
      ActionType::DeleteNote => Action::DeleteNote(serde_json::from_str(payload)?),
    };
    Ok(action)
  }

  /// Provisional id this action creates, if any.
  pub fn creates_local_id(&self) -> Option<&str> {
    match self {
      Action::SendMessage(p) => Some(&p.local_id),
      Action::WriteNote(p) => Some(&p.local_id),
      _ => None,
    }
  }

  /// Point references to a provisional id at its server id.
  /// Returns whether anything changed.
  pub fn rewrite_id(&mut self, local_id: &str, server_id: &str) -> bool {
    match self {
      Action::DeleteNote(p) if p.node_id == local_id => {
        p.node_id = server_id.to_string();
        true
      }
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_action_type_tags() {
    for action_type in [
      ActionType::WriteCare,
      ActionType::SendMessage,
      ActionType::WriteMemory,
      ActionType::DeleteMemory,
      ActionType::WriteNote,
      ActionType::DeleteNote,
    ] {
      assert_eq!(action_type.as_str().parse::<ActionType>().unwrap(), action_type);
    }
    assert!("write-everything".parse::<ActionType>().is_err());
  }

  #[test]
  fn test_decode_rejects_mismatched_payload() {
    let payload = r#"{"agent_id":"a1","key":"k1"}"#;
    assert!(Action::decode(ActionType::DeleteMemory, payload).is_ok());
    assert!(Action::decode(ActionType::WriteNote, payload).is_err());
  }

  #[test]
  fn test_creates_local_id() {
    let send = Action::SendMessage(SendMessagePayload {
      local_id: "local-1".to_string(),
      agent_id: "a1".to_string(),
      content: "hi".to_string(),
    });
    assert_eq!(send.creates_local_id(), Some("local-1"));

    let delete = Action::DeleteMemory(DeleteMemoryPayload {
      agent_id: "a1".to_string(),
      key: "k".to_string(),
    });
    assert_eq!(delete.creates_local_id(), None);
  }

  #[test]
  fn test_rewrite_id_only_touches_matching_references() {
    let mut delete = Action::DeleteNote(DeleteNotePayload {
      agent_id: "a1".to_string(),
      node_id: "local-1".to_string(),
    });
    assert!(!delete.rewrite_id("local-2", "node-2"));
    assert!(delete.rewrite_id("local-1", "node-1"));

    match delete {
      Action::DeleteNote(p) => assert_eq!(p.node_id, "node-1"),
      other => panic!("unexpected action {:?}", other),
    }
  }
}
