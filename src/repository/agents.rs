use chrono::Duration;
use futures::Stream;
use std::sync::Arc;

use super::{Entity, LocalChange, Repository, WriteOutcome};
use crate::cache::{CacheSnapshot, CacheStore};
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::queue::{Action, CarePayload, MutationQueue};
use crate::remote::types::Agent;
use crate::remote::RemoteClient;

/// The agent directory is a single global scope
const DIRECTORY_SCOPE: &str = "";

impl Entity for Agent {
  // The effect of a queued care action is only known once the server applies it
  fn apply_pending(_items: &mut Vec<Self>, _scope: &str, _action: &Action) {}
}

/// Agent directory. Slow-changing, long TTL.
#[derive(Clone)]
pub struct AgentRepository {
  repo: Repository<Agent>,
  remote: Arc<dyn RemoteClient>,
}

impl AgentRepository {
  pub fn new(
    cache: CacheStore,
    queue: MutationQueue,
    connectivity: ConnectivityMonitor,
    remote: Arc<dyn RemoteClient>,
    ttl: Duration,
  ) -> Self {
    let lister = remote.clone();
    let repo = Repository::new(cache, queue, connectivity, ttl, move |_scope: String| {
      let remote = lister.clone();
      async move { remote.list_agents().await }
    });

    Self { repo, remote }
  }

  pub fn list(&self) -> Result<CacheSnapshot<Agent>> {
    self.repo.read(DIRECTORY_SCOPE)
  }

  pub async fn refresh(&self) -> Result<()> {
    self.repo.refresh(DIRECTORY_SCOPE).await
  }

  pub fn subscribe(&self) -> impl Stream<Item = Vec<Agent>> + Send + 'static {
    self.repo.subscribe(DIRECTORY_SCOPE)
  }

  pub fn invalidate(&self) -> Result<()> {
    self.repo.invalidate(DIRECTORY_SCOPE)
  }

  /// Apply a care interaction. The updated agent replaces the cached entry
  /// once the server answers.
  pub async fn care(&self, agent_id: &str, action: &str) -> Result<WriteOutcome<Agent>> {
    let queued = Action::WriteCare(CarePayload {
      agent_id: agent_id.to_string(),
      action: action.to_string(),
    });

    let remote = self.remote.clone();
    self
      .repo
      .submit(DIRECTORY_SCOPE, LocalChange::Nothing, queued, || async move {
        remote.care_agent(agent_id, action).await.map(Some)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::db::Database;
  use crate::testing::MockRemote;

  fn repository(online: bool, remote: Arc<MockRemote>) -> (AgentRepository, MutationQueue) {
    let db = Arc::new(Database::in_memory().unwrap());
    let cache = CacheStore::new(db.clone(), Arc::new(SystemClock));
    let queue = MutationQueue::new(db, Arc::new(SystemClock));
    let repo = AgentRepository::new(
      cache,
      queue.clone(),
      ConnectivityMonitor::new(online),
      remote,
      Duration::hours(1),
    );
    (repo, queue)
  }

  #[tokio::test]
  async fn test_refresh_then_care() {
    let remote = Arc::new(MockRemote::new());
    remote.seed_agents(vec![Agent {
      id: "a1".to_string(),
      name: "Pip".to_string(),
      persona: None,
      mood: Some("sleepy".to_string()),
      updated_at: None,
    }]);
    let (repo, queue) = repository(true, remote.clone());

    repo.refresh().await.unwrap();
    assert_eq!(repo.list().unwrap().data.len(), 1);
    assert_eq!(remote.list_calls(), 1);

    let outcome = repo.care("a1", "play").await.unwrap();
    assert!(matches!(outcome, WriteOutcome::Sent(Some(_))));
    assert_eq!(repo.list().unwrap().data[0].mood.as_deref(), Some("play"));
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_care_is_queued() {
    let remote = Arc::new(MockRemote::new());
    let (repo, queue) = repository(false, remote.clone());

    let outcome = repo.care("a1", "feed").await.unwrap();

    assert!(outcome.is_queued());
    assert_eq!(queue.drain().unwrap()[0].action_type, "write-care");
    assert!(remote.calls().is_empty());
  }
}
