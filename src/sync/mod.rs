//! Replay of queued writes against the remote service.

mod scheduler;

pub use scheduler::{SyncScheduler, SyncTrigger};

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::CacheStore;
use crate::error::Result;
use crate::queue::{Action, MutationQueue, QueuedAction};
use crate::remote::types::{is_provisional, ChatMessage, MemoryNode};
use crate::remote::RemoteClient;

/// Totals for one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Actions sent to the remote service
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Actions dropped for exceeding the retry limit
  pub pruned: usize,
  /// Actions still queued after the run
  pub remaining: usize,
}

/// What replaying one action did.
enum Replay {
  Done,
  /// Depends on a create that has not reached the server yet
  Deferred,
}

/// Drains the mutation queue in FIFO order.
///
/// Runs are single-flight: concurrent calls to [`SyncManager::process_queue`]
/// wait for each other, so an action is never sent twice at the same time.
pub struct SyncManager {
  queue: MutationQueue,
  cache: CacheStore,
  remote: Arc<dyn RemoteClient>,
  max_retries: u32,
  running: Mutex<()>,
}

impl SyncManager {
  pub fn new(
    queue: MutationQueue,
    cache: CacheStore,
    remote: Arc<dyn RemoteClient>,
    max_retries: u32,
  ) -> Self {
    Self {
      queue,
      cache,
      remote,
      max_retries,
      running: Mutex::new(()),
    }
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.queue.pending_count()
  }

  /// Replay every pending action once, oldest first.
  ///
  /// A transient failure charges one retry to that action and moves on to
  /// the next. An authorization failure stops the run without charging any
  /// retry and is returned, since no later action can succeed either.
  pub async fn process_queue(&self) -> Result<SyncReport> {
    let _running = self.running.lock().await;

    let mut report = SyncReport {
      pruned: self.prune()?,
      ..SyncReport::default()
    };

    let pending = self.queue.drain()?;
    if !pending.is_empty() {
      tracing::debug!("Replaying {} queued action(s)", pending.len());
    }

    for queued in pending {
      let action = match queued.action() {
        Ok(action) => action,
        Err(e) => {
          tracing::warn!("Queued action {} does not decode: {}", queued.id, e);
          self.queue.increment_retry(queued.id, &e.to_string())?;
          report.failed += 1;
          continue;
        }
      };

      match self.replay(&queued, &action).await {
        Ok(Replay::Done) => {
          // Before the action leaves the queue, so a refresh that fetched
          // before the replay cannot overwrite its effect
          let (entity_type, scope) = action.target();
          self.cache.touch(entity_type, scope)?;
          self.queue.mark_done(queued.id)?;
          report.attempted += 1;
          report.succeeded += 1;
        }
        Ok(Replay::Deferred) => {
          tracing::debug!(
            "Deferring {} {} until its create has replayed",
            action.action_type(),
            queued.id
          );
        }
        Err(e) if e.is_unauthorized() => {
          tracing::warn!("Replay stopped, credential rejected: {}", e);
          self.prune()?;
          return Err(e);
        }
        Err(e) if e.is_transient() => {
          tracing::warn!(
            "Replay of {} {} failed (attempt {}): {}",
            action.action_type(),
            queued.id,
            queued.retry_count + 1,
            e
          );
          self.queue.increment_retry(queued.id, &e.to_string())?;
          report.attempted += 1;
          report.failed += 1;
        }
        Err(e) => return Err(e),
      }
    }

    report.pruned += self.prune()?;
    report.remaining = self.queue.pending_count()?;

    if report.attempted > 0 || report.pruned > 0 {
      tracing::info!(
        "Sync finished: {} sent, {} failed, {} dropped, {} remaining",
        report.succeeded,
        report.failed,
        report.pruned,
        report.remaining
      );
    }
    Ok(report)
  }

  /// Drop exhausted actions. Rows optimistically added by a dropped create
  /// never reached the server, so they leave the cache as well.
  fn prune(&self) -> Result<usize> {
    let pruned = self.queue.prune_exhausted(self.max_retries)?;
    for queued in &pruned {
      match queued.action() {
        Ok(Action::SendMessage(p)) => {
          self.cache.delete_one::<ChatMessage>(&p.agent_id, &p.local_id)?;
        }
        Ok(Action::WriteNote(p)) => {
          self.cache.delete_one::<MemoryNode>(&p.agent_id, &p.local_id)?;
        }
        _ => {}
      }
    }
    Ok(pruned.len())
  }

  async fn replay(&self, queued: &QueuedAction, action: &Action) -> Result<Replay> {
    match action {
      Action::WriteCare(p) => {
        let agent = self.remote.care_agent(&p.agent_id, &p.action).await?;
        self.cache.upsert_one("", &agent)?;
      }
      Action::SendMessage(p) => {
        let message = self.remote.send_message(&p.agent_id, &p.content).await?;
        self.cache.replace_one(&p.agent_id, &p.local_id, &message)?;
        self.queue.reconcile_id(&p.local_id, &message.id)?;
      }
      Action::WriteMemory(p) => {
        let memory = self.remote.set_memory(&p.agent_id, &p.key, &p.value).await?;
        self.cache.upsert_one(&p.agent_id, &memory)?;
      }
      Action::DeleteMemory(p) => {
        self.remote.delete_memory(&p.agent_id, &p.key).await?;
      }
      Action::WriteNote(p) => {
        let node = self.remote.create_memory_node(&p.agent_id, &p.node).await?;
        self.cache.replace_one(&p.agent_id, &p.local_id, &node)?;
        self.queue.reconcile_id(&p.local_id, &node.id)?;
      }
      Action::DeleteNote(p) => {
        let node_id = match self.resolve(&p.node_id)? {
          Resolved::Server(id) => id,
          Resolved::Pending => return Ok(Replay::Deferred),
          Resolved::NeverCreated => {
            tracing::debug!(
              "Dropping delete {} of {}, it never reached the server",
              queued.id,
              p.node_id
            );
            return Ok(Replay::Done);
          }
        };
        self.remote.delete_memory_node(&p.agent_id, &node_id).await?;
      }
    }
    Ok(Replay::Done)
  }

  /// Map an id that may be provisional onto the server's id.
  fn resolve(&self, id: &str) -> Result<Resolved> {
    if !is_provisional(id) {
      return Ok(Resolved::Server(id.to_string()));
    }
    if let Some(server_id) = self.queue.resolve_id(id)? {
      return Ok(Resolved::Server(server_id));
    }
    if self.queue.has_pending_create(id)? {
      return Ok(Resolved::Pending);
    }
    Ok(Resolved::NeverCreated)
  }
}

enum Resolved {
  Server(String),
  Pending,
  NeverCreated,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::error::Error;
  use crate::connectivity::ConnectivityMonitor;
  use crate::db::Database;
  use crate::queue::{DeleteMemoryPayload, DeleteNotePayload, WriteMemoryPayload, WriteNotePayload};
  use crate::remote::types::{Memory, NewMemoryNode};
  use crate::repository::{MemoryRepository, NoteRepository, Repository};
  use crate::testing::MockRemote;
  use chrono::Duration;
  use tokio::sync::Notify;

  struct Fixture {
    cache: CacheStore,
    queue: MutationQueue,
    remote: Arc<MockRemote>,
    manager: Arc<SyncManager>,
  }

  impl Fixture {
    fn new() -> Self {
      let db = Arc::new(Database::in_memory().unwrap());
      let cache = CacheStore::new(db.clone(), Arc::new(SystemClock));
      let queue = MutationQueue::new(db, Arc::new(SystemClock));
      let remote = Arc::new(MockRemote::new());
      let manager = Arc::new(SyncManager::new(
        queue.clone(),
        cache.clone(),
        remote.clone(),
        3,
      ));
      Self {
        cache,
        queue,
        remote,
        manager,
      }
    }
  }

  fn set(key: &str) -> Action {
    Action::WriteMemory(WriteMemoryPayload {
      agent_id: "agent-1".to_string(),
      key: key.to_string(),
      value: "v".to_string(),
    })
  }

  fn remove(key: &str) -> Action {
    Action::DeleteMemory(DeleteMemoryPayload {
      agent_id: "agent-1".to_string(),
      key: key.to_string(),
    })
  }

  fn create_note(local_id: &str) -> Action {
    Action::WriteNote(WriteNotePayload {
      local_id: local_id.to_string(),
      agent_id: "agent-1".to_string(),
      node: NewMemoryNode {
        content: "likes tea".to_string(),
        category: None,
        importance: None,
      },
    })
  }

  fn delete_note(node_id: &str) -> Action {
    Action::DeleteNote(DeleteNotePayload {
      agent_id: "agent-1".to_string(),
      node_id: node_id.to_string(),
    })
  }

  #[tokio::test]
  async fn test_replays_in_fifo_order_despite_failures() {
    let fixture = Fixture::new();
    fixture.queue.enqueue(&set("a")).unwrap();
    fixture.queue.enqueue(&remove("b")).unwrap();
    fixture.queue.enqueue(&set("c")).unwrap();
    fixture.remote.fail_next(Error::Server(503));

    let report = fixture.manager.process_queue().await.unwrap();

    assert_eq!(
      fixture.remote.calls(),
      vec![
        "set_memory agent-1 a".to_string(),
        "delete_memory agent-1 b".to_string(),
        "set_memory agent-1 c".to_string(),
      ]
    );
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);

    let pending = fixture.queue.drain().unwrap();
    assert_eq!(pending[0].action().unwrap(), set("a"));
    assert_eq!(pending[0].retry_count, 1);
  }

  #[tokio::test]
  async fn test_three_failed_runs_drop_the_action() {
    let fixture = Fixture::new();
    fixture.queue.enqueue(&set("a")).unwrap();
    fixture.remote.fail_all(true);

    for _ in 0..2 {
      let report = fixture.manager.process_queue().await.unwrap();
      assert_eq!(report.remaining, 1);
    }
    let report = fixture.manager.process_queue().await.unwrap();

    assert_eq!(report.pruned, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(fixture.manager.pending_count().unwrap(), 0);
    assert_eq!(fixture.remote.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_offline_write_replays_exactly_once() {
    let fixture = Fixture::new();
    let connectivity = ConnectivityMonitor::new(false);
    let memories = MemoryRepository::new(
      fixture.cache.clone(),
      fixture.queue.clone(),
      connectivity.clone(),
      fixture.remote.clone(),
      Duration::minutes(15),
    );

    let outcome = memories.set("agent-1", "k1", "v1").await.unwrap();
    assert!(outcome.is_queued());
    assert_eq!(memories.list("agent-1").unwrap().data[0].value, "v1");

    connectivity.set_online(true);
    let first = fixture.manager.process_queue().await.unwrap();
    let second = fixture.manager.process_queue().await.unwrap();

    assert_eq!(first.succeeded, 1);
    assert_eq!(second.attempted, 0);
    assert_eq!(
      fixture.remote.calls(),
      vec!["set_memory agent-1 k1".to_string()]
    );
    assert_eq!(fixture.queue.pending_count().unwrap(), 0);
    assert_eq!(
      fixture.remote.memories("agent-1"),
      vec![Memory {
        key: "k1".to_string(),
        value: "v1".to_string(),
        updated_at: Some("2024-05-01T10:00:00Z".to_string()),
      }]
    );
    // Cache carries the server's version
    let cached = fixture.cache.get::<Memory>("agent-1").unwrap();
    assert!(cached[0].updated_at.is_some());
  }

  #[tokio::test]
  async fn test_concurrent_runs_are_serialized() {
    let fixture = Fixture::new();
    fixture.queue.enqueue(&set("a")).unwrap();
    fixture
      .remote
      .set_delay(std::time::Duration::from_millis(50));

    let (first, second) = tokio::join!(
      fixture.manager.process_queue(),
      fixture.manager.process_queue()
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.attempted + second.attempted, 1);
    assert_eq!(fixture.remote.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_auth_failure_stops_without_charging_retries() {
    let fixture = Fixture::new();
    fixture.queue.enqueue(&set("a")).unwrap();
    fixture.queue.enqueue(&set("b")).unwrap();
    fixture
      .remote
      .fail_next(Error::Unauthorized("HTTP 401".to_string()));

    let result = fixture.manager.process_queue().await;

    assert!(result.unwrap_err().is_unauthorized());
    assert_eq!(fixture.remote.calls().len(), 1);
    let pending = fixture.queue.drain().unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|q| q.retry_count == 0));
  }

  #[tokio::test]
  async fn test_offline_create_then_delete_reconciles_ids() {
    let fixture = Fixture::new();
    let connectivity = ConnectivityMonitor::new(false);
    let notes = NoteRepository::new(
      fixture.cache.clone(),
      fixture.queue.clone(),
      connectivity.clone(),
      fixture.remote.clone(),
      Duration::minutes(5),
    );

    notes
      .add(
        "agent-1",
        NewMemoryNode {
          content: "likes tea".to_string(),
          category: None,
          importance: None,
        },
      )
      .await
      .unwrap();
    let local_id = notes.list("agent-1").unwrap().data[0].id.clone();
    notes.delete("agent-1", &local_id).await.unwrap();
    assert!(notes.list("agent-1").unwrap().data.is_empty());

    connectivity.set_online(true);
    let report = fixture.manager.process_queue().await.unwrap();

    assert_eq!(report.succeeded, 2);
    let calls = fixture.remote.calls();
    assert_eq!(calls[0], "create_memory_node agent-1");
    assert!(calls[1].starts_with("delete_memory_node agent-1 node-"));
    assert!(fixture.remote.nodes("agent-1").is_empty());
    assert!(fixture.cache.get::<MemoryNode>("agent-1").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_created_node_gets_server_id_in_cache() {
    let fixture = Fixture::new();
    fixture
      .cache
      .upsert_one(
        "agent-1",
        &MemoryNode {
          id: "local-1".to_string(),
          content: "likes tea".to_string(),
          category: None,
          importance: None,
          created_at: None,
        },
      )
      .unwrap();
    fixture.queue.enqueue(&create_note("local-1")).unwrap();

    fixture.manager.process_queue().await.unwrap();

    let cached = fixture.cache.get::<MemoryNode>("agent-1").unwrap();
    assert_eq!(cached.len(), 1);
    assert!(!is_provisional(&cached[0].id));
    assert_eq!(
      fixture.queue.resolve_id("local-1").unwrap(),
      Some(cached[0].id.clone())
    );
  }

  #[tokio::test]
  async fn test_delete_waits_for_failed_create() {
    let fixture = Fixture::new();
    fixture.queue.enqueue(&create_note("local-1")).unwrap();
    fixture.queue.enqueue(&delete_note("local-1")).unwrap();
    fixture.remote.fail_next(Error::Timeout("30s".to_string()));

    let report = fixture.manager.process_queue().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(
      fixture.remote.calls(),
      vec!["create_memory_node agent-1".to_string()]
    );
    let pending = fixture.queue.drain().unwrap();
    assert_eq!(pending[1].retry_count, 0);
  }

  #[tokio::test]
  async fn test_delete_of_never_created_node_is_noop() {
    let fixture = Fixture::new();
    fixture.queue.enqueue(&delete_note("local-gone")).unwrap();

    let report = fixture.manager.process_queue().await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.remaining, 0);
    assert!(fixture.remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_exhausted_action_is_pruned_before_replay() {
    let fixture = Fixture::new();
    let id = fixture.queue.enqueue(&set("a")).unwrap();
    for _ in 0..3 {
      fixture.queue.increment_retry(id, "boom").unwrap();
    }

    let report = fixture.manager.process_queue().await.unwrap();

    assert_eq!(report.pruned, 1);
    assert_eq!(report.attempted, 0);
    assert!(fixture.remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_pruned_create_leaves_the_cache() {
    let fixture = Fixture::new();
    let connectivity = ConnectivityMonitor::new(false);
    let notes = NoteRepository::new(
      fixture.cache.clone(),
      fixture.queue.clone(),
      connectivity.clone(),
      fixture.remote.clone(),
      Duration::minutes(5),
    );
    notes
      .add(
        "agent-1",
        NewMemoryNode {
          content: "likes tea".to_string(),
          category: None,
          importance: None,
        },
      )
      .await
      .unwrap();
    assert_eq!(notes.list("agent-1").unwrap().data.len(), 1);

    connectivity.set_online(true);
    fixture.remote.fail_all(true);
    for _ in 0..3 {
      fixture.manager.process_queue().await.unwrap();
    }

    assert_eq!(fixture.queue.pending_count().unwrap(), 0);
    assert!(fixture.cache.get::<MemoryNode>("agent-1").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_refresh_racing_a_replayed_delete_keeps_it_deleted() {
    let fixture = Fixture::new();
    let memory = Memory {
      key: "k1".to_string(),
      value: "v1".to_string(),
      updated_at: None,
    };
    fixture
      .cache
      .replace_all("agent-1", std::slice::from_ref(&memory))
      .unwrap();
    fixture.remote.seed_memories("agent-1", vec![memory.clone()]);
    fixture.queue.enqueue(&remove("k1")).unwrap();
    fixture.cache.delete_one::<Memory>("agent-1", "k1").unwrap();

    // Lister that answers with the list as it was, once released
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let repo = {
      let started = started.clone();
      let release = release.clone();
      Repository::new(
        fixture.cache.clone(),
        fixture.queue.clone(),
        ConnectivityMonitor::new(true),
        Duration::minutes(15),
        move |_| {
          let started = started.clone();
          let release = release.clone();
          let listed = vec![memory.clone()];
          async move {
            started.notify_one();
            release.notified().await;
            Ok(listed)
          }
        },
      )
    };

    let refresh = {
      let repo = repo.clone();
      tokio::spawn(async move { repo.refresh("agent-1").await })
    };
    started.notified().await;

    let report = fixture.manager.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(fixture.remote.memories("agent-1").is_empty());

    release.notify_one();
    refresh.await.unwrap().unwrap();

    assert!(fixture.cache.get::<Memory>("agent-1").unwrap().is_empty());
  }
}
