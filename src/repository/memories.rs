use chrono::Duration;
use futures::Stream;
use std::sync::Arc;

use super::{upsert_by_key, Entity, Repository, WriteOutcome};
use crate::cache::{CacheSnapshot, CacheStore};
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::queue::{Action, DeleteMemoryPayload, MutationQueue, WriteMemoryPayload};
use crate::remote::types::Memory;
use crate::remote::RemoteClient;

impl Entity for Memory {
  fn apply_pending(items: &mut Vec<Self>, scope: &str, action: &Action) {
    match action {
      Action::WriteMemory(p) if p.agent_id == scope => upsert_by_key(
        items,
        Memory {
          key: p.key.clone(),
          value: p.value.clone(),
          updated_at: None,
        },
      ),
      Action::DeleteMemory(p) if p.agent_id == scope => items.retain(|m| m.key != p.key),
      _ => {}
    }
  }
}

/// Key/value memories, scoped per agent.
#[derive(Clone)]
pub struct MemoryRepository {
  repo: Repository<Memory>,
  remote: Arc<dyn RemoteClient>,
}

impl MemoryRepository {
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
      async move { remote.list_memories(&agent_id).await }
    });

    Self { repo, remote }
  }

  pub fn list(&self, agent_id: &str) -> Result<CacheSnapshot<Memory>> {
    self.repo.read(agent_id)
  }

  pub async fn refresh(&self, agent_id: &str) -> Result<()> {
    self.repo.refresh(agent_id).await
  }

  pub fn subscribe(&self, agent_id: &str) -> impl Stream<Item = Vec<Memory>> + Send + 'static {
    self.repo.subscribe(agent_id)
  }

  pub fn invalidate(&self, agent_id: &str) -> Result<()> {
    self.repo.invalidate(agent_id)
  }

  pub async fn set(&self, agent_id: &str, key: &str, value: &str) -> Result<WriteOutcome<Memory>> {
    let item = Memory {
      key: key.to_string(),
      value: value.to_string(),
      updated_at: None,
    };
    let action = Action::WriteMemory(WriteMemoryPayload {
      agent_id: agent_id.to_string(),
      key: key.to_string(),
      value: value.to_string(),
    });

    let remote = self.remote.clone();
    self
      .repo
      .write(agent_id, item, action, || async move {
        remote.set_memory(agent_id, key, value).await
      })
      .await
  }

  pub async fn delete(&self, agent_id: &str, key: &str) -> Result<WriteOutcome<Memory>> {
    let action = Action::DeleteMemory(DeleteMemoryPayload {
      agent_id: agent_id.to_string(),
      key: key.to_string(),
    });

    let remote = self.remote.clone();
    self
      .repo
      .delete(agent_id, key, action, || async move {
        remote.delete_memory(agent_id, key).await
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn memory(key: &str, value: &str) -> Memory {
    Memory {
      key: key.to_string(),
      value: value.to_string(),
      updated_at: None,
    }
  }

  #[test]
  fn test_apply_pending_respects_scope() {
    let mut items = vec![memory("a", "1"), memory("b", "2")];

    Memory::apply_pending(
      &mut items,
      "agent-1",
      &Action::WriteMemory(WriteMemoryPayload {
        agent_id: "agent-1".to_string(),
        key: "a".to_string(),
        value: "local".to_string(),
      }),
    );
    Memory::apply_pending(
      &mut items,
      "agent-1",
      &Action::DeleteMemory(DeleteMemoryPayload {
        agent_id: "agent-2".to_string(),
        key: "b".to_string(),
      }),
    );
    Memory::apply_pending(
      &mut items,
      "agent-1",
      &Action::DeleteMemory(DeleteMemoryPayload {
        agent_id: "agent-1".to_string(),
        key: "b".to_string(),
      }),
    );

    assert_eq!(items, vec![memory("a", "local")]);
  }
}
