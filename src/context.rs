//! Composition root: builds and owns every sync component.

use chrono::Duration;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, Config};
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe, TcpProbe};
use crate::db::Database;
use crate::error::Result;
use crate::queue::MutationQueue;
use crate::remote::{HttpRemoteClient, RemoteClient};
use crate::repository::{AgentRepository, ChatRepository, MemoryRepository, NoteRepository};
use crate::sync::{SyncManager, SyncScheduler};

/// Everything an application needs to read and write agent data offline.
///
/// Components are shared handles, so cloning pieces out of the context is
/// cheap and they stay connected to the same database and queue.
pub struct SyncContext {
  pub connectivity: ConnectivityMonitor,
  pub cache: CacheStore,
  pub queue: MutationQueue,
  pub remote: Arc<dyn RemoteClient>,
  pub agents: AgentRepository,
  pub chat: ChatRepository,
  pub memories: MemoryRepository,
  pub notes: NoteRepository,
  pub sync: Arc<SyncManager>,
  probe: Option<Arc<dyn ReachabilityProbe>>,
  sync_interval: std::time::Duration,
}

impl SyncContext {
  /// Wire components around an already opened database and remote client.
  pub fn new(
    config: &Config,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    connectivity: ConnectivityMonitor,
    remote: Arc<dyn RemoteClient>,
  ) -> Self {
    let cache = CacheStore::new(db.clone(), clock.clone());
    let queue = MutationQueue::new(db, clock);
    let ttl = Ttls::from(&config.cache);

    let agents = AgentRepository::new(
      cache.clone(),
      queue.clone(),
      connectivity.clone(),
      remote.clone(),
      ttl.agents,
    );
    let chat = ChatRepository::new(
      cache.clone(),
      queue.clone(),
      connectivity.clone(),
      remote.clone(),
      ttl.chat,
    );
    let memories = MemoryRepository::new(
      cache.clone(),
      queue.clone(),
      connectivity.clone(),
      remote.clone(),
      ttl.memories,
    );
    let notes = NoteRepository::new(
      cache.clone(),
      queue.clone(),
      connectivity.clone(),
      remote.clone(),
      ttl.memory_nodes,
    );
    let sync = Arc::new(SyncManager::new(
      queue.clone(),
      cache.clone(),
      remote.clone(),
      config.sync.max_retries,
    ));

    Self {
      connectivity,
      cache,
      queue,
      remote,
      agents,
      chat,
      memories,
      notes,
      sync,
      probe: None,
      // A zero period would make the scheduler spin
      sync_interval: std::time::Duration::from_secs(config.sync.interval_secs.max(1)),
    }
  }

  /// Open the configured database, build the HTTP client and seed
  /// connectivity from a reachability probe of the service host.
  pub async fn open(config: &Config, token: Option<String>) -> Result<Self> {
    let path = match &config.database_path {
      Some(path) => path.clone(),
      None => Database::default_path()?,
    };
    let db = Arc::new(Database::open(&path)?);
    let remote = Arc::new(HttpRemoteClient::new(&config.remote, token)?);

    let probe: Arc<dyn ReachabilityProbe> = Arc::new(TcpProbe::for_url(
      &config.remote.base_url,
      std::time::Duration::from_secs(config.remote.connect_timeout_secs),
    )?);
    let connectivity = ConnectivityMonitor::with_probe(probe.as_ref()).await;

    let mut context = Self::new(config, db, Arc::new(SystemClock), connectivity, remote);
    context.probe = Some(probe);
    Ok(context)
  }

  /// Start replaying the queue in the background.
  pub fn spawn_scheduler(&self) -> SyncScheduler {
    SyncScheduler::spawn(
      self.sync.clone(),
      self.connectivity.clone(),
      self.sync_interval,
      self.probe.clone(),
    )
  }

  /// Forget everything tied to the current pairing: cached data, pending
  /// writes and the credential. Returns how many queued writes were dropped.
  pub fn unpair(&self) -> Result<usize> {
    self.cache.clear_all()?;
    let dropped = self.queue.clear()?;
    self.remote.forget_credentials();

    if dropped > 0 {
      tracing::warn!("Unpaired with {} unsent write(s) discarded", dropped);
    }
    Ok(dropped)
  }
}

struct Ttls {
  agents: Duration,
  chat: Duration,
  memories: Duration,
  memory_nodes: Duration,
}

impl From<&CacheConfig> for Ttls {
  fn from(config: &CacheConfig) -> Self {
    Self {
      agents: Duration::seconds(config.agents_ttl_secs),
      chat: Duration::seconds(config.chat_ttl_secs),
      memories: Duration::seconds(config.memories_ttl_secs),
      memory_nodes: Duration::seconds(config.memory_nodes_ttl_secs),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::testing::MockRemote;
  use chrono::{TimeZone, Utc};
  use futures::StreamExt;

  fn context(online: bool) -> (SyncContext, ManualClock, Arc<MockRemote>) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    let remote = Arc::new(MockRemote::new());
    let context = SyncContext::new(
      &Config::default(),
      Arc::new(Database::in_memory().unwrap()),
      Arc::new(clock.clone()),
      ConnectivityMonitor::new(online),
      remote.clone(),
    );
    (context, clock, remote)
  }

  #[tokio::test]
  async fn test_ttls_follow_config() {
    let (context, clock, remote) = context(true);
    remote.seed_memories("agent-1", Vec::new());
    context.memories.refresh("agent-1").await.unwrap();
    context.notes.refresh("agent-1").await.unwrap();

    // Past the 5 minute note TTL, inside the 15 minute memory TTL
    clock.advance(Duration::minutes(6));
    context.connectivity.set_online(false);

    assert!(!context.memories.list("agent-1").unwrap().is_stale);
    assert!(context.notes.list("agent-1").unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_unpair_drops_cache_and_queue() {
    let (context, _clock, _remote) = context(false);
    context.memories.set("agent-1", "k1", "v1").await.unwrap();
    context.chat.send("agent-1", "hello").await.unwrap();
    assert_eq!(context.sync.pending_count().unwrap(), 2);

    let mut memories = Box::pin(context.memories.subscribe("agent-1"));
    assert_eq!(memories.next().await.unwrap().len(), 1);

    assert_eq!(context.unpair().unwrap(), 2);

    // Open subscriptions see the cleared scope
    assert!(memories.next().await.unwrap().is_empty());

    assert_eq!(context.sync.pending_count().unwrap(), 0);
    assert!(context.memories.list("agent-1").unwrap().data.is_empty());
    assert!(context.chat.history("agent-1").unwrap().data.is_empty());
  }
}
