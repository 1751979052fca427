//! In-process stand-in for the remote service.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::remote::types::{Agent, ChatMessage, Memory, MemoryNode, NewMemoryNode};
use crate::remote::RemoteClient;

#[derive(Default)]
struct State {
  agents: Vec<Agent>,
  messages: HashMap<String, Vec<ChatMessage>>,
  memories: HashMap<String, Vec<Memory>>,
  nodes: HashMap<String, Vec<MemoryNode>>,
  /// Errors handed out, in order, to the next mutating calls
  failures: VecDeque<Error>,
  fail_all: bool,
  calls: Vec<String>,
  lists: usize,
  next_id: u64,
}

/// Mock [`RemoteClient`] backed by in-memory collections.
///
/// Mutating calls are logged in order and can be scripted to fail.
#[derive(Default)]
pub struct MockRemote {
  state: Mutex<State>,
  delay: Mutex<Option<Duration>>,
}

impl MockRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn seed_agents(&self, agents: Vec<Agent>) {
    self.state.lock().unwrap().agents = agents;
  }

  pub fn seed_memories(&self, agent_id: &str, memories: Vec<Memory>) {
    self
      .state
      .lock()
      .unwrap()
      .memories
      .insert(agent_id.to_string(), memories);
  }

  /// Fail the next mutating call with `error`.
  pub fn fail_next(&self, error: Error) {
    self.state.lock().unwrap().failures.push_back(error);
  }

  /// Fail every mutating call with a network error until turned off.
  pub fn fail_all(&self, fail: bool) {
    self.state.lock().unwrap().fail_all = fail;
  }

  /// Make every call sleep first.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Mutating calls received so far, e.g. `"set_memory agent-1 k1"`.
  pub fn calls(&self) -> Vec<String> {
    self.state.lock().unwrap().calls.clone()
  }

  /// Number of list calls received so far.
  pub fn list_calls(&self) -> usize {
    self.state.lock().unwrap().lists
  }

  pub fn memories(&self, agent_id: &str) -> Vec<Memory> {
    self
      .state
      .lock()
      .unwrap()
      .memories
      .get(agent_id)
      .cloned()
      .unwrap_or_default()
  }

  pub fn nodes(&self, agent_id: &str) -> Vec<MemoryNode> {
    self
      .state
      .lock()
      .unwrap()
      .nodes
      .get(agent_id)
      .cloned()
      .unwrap_or_default()
  }

  async fn pause(&self) {
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
  }

  async fn list<T>(&self, read: impl FnOnce(&State) -> T) -> Result<T> {
    self.pause().await;
    let mut state = self.state.lock().unwrap();
    state.lists += 1;
    Ok(read(&state))
  }

  /// Log a mutating call, then apply it unless a failure is scripted.
  async fn mutate<T>(&self, call: String, apply: impl FnOnce(&mut State) -> T) -> Result<T> {
    self.pause().await;
    let mut state = self.state.lock().unwrap();
    state.calls.push(call);
    if let Some(error) = state.failures.pop_front() {
      return Err(error);
    }
    if state.fail_all {
      return Err(Error::Network("connection refused".to_string()));
    }
    Ok(apply(&mut state))
  }
}

impl State {
  fn next_id(&mut self, prefix: &str) -> String {
    self.next_id += 1;
    format!("{}-{}", prefix, self.next_id)
  }
}

#[async_trait]
impl RemoteClient for MockRemote {
  async fn list_agents(&self) -> Result<Vec<Agent>> {
    self.list(|state| state.agents.clone()).await
  }

  async fn care_agent(&self, agent_id: &str, action: &str) -> Result<Agent> {
    let call = format!("care_agent {} {}", agent_id, action);
    self
      .mutate(call, |state| {
        let index = match state.agents.iter().position(|a| a.id == agent_id) {
          Some(index) => index,
          None => {
            state.agents.push(Agent {
              id: agent_id.to_string(),
              name: agent_id.to_string(),
              persona: None,
              mood: None,
              updated_at: None,
            });
            state.agents.len() - 1
          }
        };
        state.agents[index].mood = Some(action.to_string());
        state.agents[index].clone()
      })
      .await
  }

  async fn list_messages(&self, agent_id: &str) -> Result<Vec<ChatMessage>> {
    self
      .list(|state| state.messages.get(agent_id).cloned().unwrap_or_default())
      .await
  }

  async fn send_message(&self, agent_id: &str, content: &str) -> Result<ChatMessage> {
    let call = format!("send_message {}", agent_id);
    self
      .mutate(call, |state| {
        let message = ChatMessage {
          id: state.next_id("msg"),
          agent_id: agent_id.to_string(),
          role: "user".to_string(),
          content: content.to_string(),
          created_at: None,
        };
        state
          .messages
          .entry(agent_id.to_string())
          .or_default()
          .push(message.clone());
        message
      })
      .await
  }

  async fn list_memories(&self, agent_id: &str) -> Result<Vec<Memory>> {
    self
      .list(|state| state.memories.get(agent_id).cloned().unwrap_or_default())
      .await
  }

  async fn set_memory(&self, agent_id: &str, key: &str, value: &str) -> Result<Memory> {
    let call = format!("set_memory {} {}", agent_id, key);
    self
      .mutate(call, |state| {
        let memory = Memory {
          key: key.to_string(),
          value: value.to_string(),
          updated_at: Some("2024-05-01T10:00:00Z".to_string()),
        };
        let memories = state.memories.entry(agent_id.to_string()).or_default();
        match memories.iter().position(|m| m.key == key) {
          Some(index) => memories[index] = memory.clone(),
          None => memories.push(memory.clone()),
        }
        memory
      })
      .await
  }

  async fn delete_memory(&self, agent_id: &str, key: &str) -> Result<()> {
    let call = format!("delete_memory {} {}", agent_id, key);
    self
      .mutate(call, |state| {
        if let Some(memories) = state.memories.get_mut(agent_id) {
          memories.retain(|m| m.key != key);
        }
      })
      .await
  }

  async fn list_memory_nodes(&self, agent_id: &str) -> Result<Vec<MemoryNode>> {
    self
      .list(|state| state.nodes.get(agent_id).cloned().unwrap_or_default())
      .await
  }

  async fn create_memory_node(&self, agent_id: &str, node: &NewMemoryNode) -> Result<MemoryNode> {
    let call = format!("create_memory_node {}", agent_id);
    self
      .mutate(call, |state| {
        let created = MemoryNode {
          id: state.next_id("node"),
          content: node.content.clone(),
          category: node.category.clone(),
          importance: node.importance,
          created_at: None,
        };
        state
          .nodes
          .entry(agent_id.to_string())
          .or_default()
          .push(created.clone());
        created
      })
      .await
  }

  async fn delete_memory_node(&self, agent_id: &str, node_id: &str) -> Result<()> {
    let call = format!("delete_memory_node {} {}", agent_id, node_id);
    self
      .mutate(call, |state| {
        if let Some(nodes) = state.nodes.get_mut(agent_id) {
          nodes.retain(|n| n.id != node_id);
        }
      })
      .await
  }
}
