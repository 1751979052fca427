use chrono::{Duration, Utc};
use futures::Stream;
use std::sync::Arc;

use super::{Entity, Repository, WriteOutcome};
use crate::cache::{CacheSnapshot, CacheStore};
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::queue::{Action, MutationQueue, SendMessagePayload};
use crate::remote::types::{provisional_id, ChatMessage};
use crate::remote::RemoteClient;

impl Entity for ChatMessage {
  fn apply_pending(items: &mut Vec<Self>, scope: &str, action: &Action) {
    if let Action::SendMessage(p) = action {
      // Unsent messages stay at the end of the history
      if p.agent_id == scope && !items.iter().any(|m| m.id == p.local_id) {
        items.push(ChatMessage {
          id: p.local_id.clone(),
          agent_id: p.agent_id.clone(),
          role: "user".to_string(),
          content: p.content.clone(),
          created_at: None,
        });
      }
    }
  }
}

/// Chat history, scoped per agent.
#[derive(Clone)]
pub struct ChatRepository {
  repo: Repository<ChatMessage>,
  remote: Arc<dyn RemoteClient>,
}

impl ChatRepository {
  pub fn new(
    cache: CacheStore,
    queue: MutationQueue,
    connectivity: ConnectivityMonitor,
    remote: Arc<dyn RemoteClient>,
    ttl: Duration,
  ) -> Self {
    let lister = remote.clone();
    let repo = Repository::new(cache, queue, connectivity, ttl, move |agent_id: String| {
      let remote = lister.clone();
      async move { remote.list_messages(&agent_id).await }
    });

    Self { repo, remote }
  }

  pub fn history(&self, agent_id: &str) -> Result<CacheSnapshot<ChatMessage>> {
    self.repo.read(agent_id)
  }

  pub async fn refresh(&self, agent_id: &str) -> Result<()> {
    self.repo.refresh(agent_id).await
  }

  pub fn subscribe(&self, agent_id: &str) -> impl Stream<Item = Vec<ChatMessage>> + Send + 'static {
    self.repo.subscribe(agent_id)
  }

  pub fn invalidate(&self, agent_id: &str) -> Result<()> {
    self.repo.invalidate(agent_id)
  }

  /// Append a user message. It shows up in the history immediately.
  pub async fn send(&self, agent_id: &str, content: &str) -> Result<WriteOutcome<ChatMessage>> {
    let local_id = provisional_id();
    let item = ChatMessage {
      id: local_id.clone(),
      agent_id: agent_id.to_string(),
      role: "user".to_string(),
      content: content.to_string(),
      created_at: Some(Utc::now().to_rfc3339()),
    };
    let action = Action::SendMessage(SendMessagePayload {
      local_id,
      agent_id: agent_id.to_string(),
      content: content.to_string(),
    });

    let remote = self.remote.clone();
    self
      .repo
      .write(agent_id, item, action, || async move {
        remote.send_message(agent_id, content).await
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn message(id: &str, content: &str) -> ChatMessage {
    ChatMessage {
      id: id.to_string(),
      agent_id: "agent-1".to_string(),
      role: "agent".to_string(),
      content: content.to_string(),
      created_at: None,
    }
  }

  #[test]
  fn test_pending_message_appended_once() {
    let mut items = vec![message("m1", "hello")];
    let action = Action::SendMessage(SendMessagePayload {
      local_id: "local-7".to_string(),
      agent_id: "agent-1".to_string(),
      content: "how are you?".to_string(),
    });

    ChatMessage::apply_pending(&mut items, "agent-1", &action);
    ChatMessage::apply_pending(&mut items, "agent-1", &action);
    ChatMessage::apply_pending(&mut items, "agent-2", &action);

    assert_eq!(items.len(), 2);
    assert_eq!(items[1].id, "local-7");
    assert_eq!(items[1].role, "user");
  }
}
