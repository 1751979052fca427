use chrono::Duration;
use futures::Stream;
use std::sync::Arc;

use super::{upsert_by_key, Entity, Repository, WriteOutcome};
use crate::cache::{CacheSnapshot, CacheStore};
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::queue::{Action, DeleteNotePayload, MutationQueue, WriteNotePayload};
use crate::remote::types::{provisional_id, MemoryNode, NewMemoryNode};
use crate::remote::RemoteClient;

impl Entity for MemoryNode {
  fn apply_pending(items: &mut Vec<Self>, scope: &str, action: &Action) {
    match action {
      Action::WriteNote(p) if p.agent_id == scope => {
        upsert_by_key(items, draft_node(&p.local_id, &p.node))
      }
      Action::DeleteNote(p) if p.agent_id == scope => items.retain(|n| n.id != p.node_id),
      _ => {}
    }
  }
}

fn draft_node(local_id: &str, node: &NewMemoryNode) -> MemoryNode {
  MemoryNode {
    id: local_id.to_string(),
    content: node.content.clone(),
    category: node.category.clone(),
    importance: node.importance,
    created_at: None,
  }
}

/// Semantic memory nodes, scoped per agent. Fast-changing, short TTL.
#[derive(Clone)]
pub struct NoteRepository {
  repo: Repository<MemoryNode>,
  remote: Arc<dyn RemoteClient>,
}

impl NoteRepository {
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
      async move { remote.list_memory_nodes(&agent_id).await }
    });

    Self { repo, remote }
  }

  pub fn list(&self, agent_id: &str) -> Result<CacheSnapshot<MemoryNode>> {
    self.repo.read(agent_id)
  }

  pub async fn refresh(&self, agent_id: &str) -> Result<()> {
    self.repo.refresh(agent_id).await
  }

  pub fn subscribe(&self, agent_id: &str) -> impl Stream<Item = Vec<MemoryNode>> + Send + 'static {
    self.repo.subscribe(agent_id)
  }

  pub fn invalidate(&self, agent_id: &str) -> Result<()> {
    self.repo.invalidate(agent_id)
  }

  /// Add a node. Until the server confirms it, the node lives under a
  /// provisional id, which later deletes may use.
  pub async fn add(&self, agent_id: &str, node: NewMemoryNode) -> Result<WriteOutcome<MemoryNode>> {
    let local_id = provisional_id();
    let item = draft_node(&local_id, &node);
    let action = Action::WriteNote(WriteNotePayload {
      local_id,
      agent_id: agent_id.to_string(),
      node: node.clone(),
    });

    let remote = self.remote.clone();
    self
      .repo
      .write(agent_id, item, action, || async move {
        remote.create_memory_node(agent_id, &node).await
      })
      .await
  }

  pub async fn delete(&self, agent_id: &str, node_id: &str) -> Result<WriteOutcome<MemoryNode>> {
    let action = Action::DeleteNote(DeleteNotePayload {
      agent_id: agent_id.to_string(),
      node_id: node_id.to_string(),
    });

    let remote = self.remote.clone();
    self
      .repo
      .delete(agent_id, node_id, action, || async move {
        remote.delete_memory_node(agent_id, node_id).await
      })
      .await
  }
}
