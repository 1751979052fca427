//! Background task that keeps the queue draining.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::SyncManager;
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe};

/// Why a replay run started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  Interval,
  Reconnected,
  Requested,
}

/// Handle to the running scheduler. Dropping it stops the task.
pub struct SyncScheduler {
  requests: mpsc::UnboundedSender<()>,
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

impl SyncScheduler {
  /// Replay the queue every `interval` while online, and right after every
  /// offline to online transition.
  ///
  /// With a probe, connectivity is re-checked on every interval tick before
  /// deciding whether to run.
  pub fn spawn(
    manager: Arc<SyncManager>,
    connectivity: ConnectivityMonitor,
    interval: Duration,
    probe: Option<Arc<dyn ReachabilityProbe>>,
  ) -> Self {
    let (requests, mut requested) = mpsc::unbounded_channel();
    let (shutdown, mut stop) = watch::channel(false);
    let mut transitions = connectivity.subscribe();

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        let trigger = tokio::select! {
          _ = stop.changed() => break,
          _ = ticker.tick() => {
            if let Some(probe) = &probe {
              connectivity.refresh(probe.as_ref()).await;
            }
            SyncTrigger::Interval
          }
          Some(()) = requested.recv() => SyncTrigger::Requested,
          changed = transitions.changed() => {
            if changed.is_err() {
              break;
            }
            if !*transitions.borrow_and_update() {
              continue;
            }
            SyncTrigger::Reconnected
          }
        };

        // A probe refresh above may have flipped the flag; that transition
        // is handled by this run
        transitions.borrow_and_update();

        if !connectivity.is_online() {
          tracing::debug!("Offline, skipping {:?} sync", trigger);
          continue;
        }

        tracing::debug!("Starting {:?} sync", trigger);
        match manager.process_queue().await {
          Ok(_) => {}
          Err(e) if e.is_unauthorized() => {
            tracing::warn!("Sync paused until the device is paired again: {}", e)
          }
          Err(e) => tracing::error!("Sync failed: {}", e),
        }
      }

      tracing::debug!("Sync scheduler stopped");
    });

    Self {
      requests,
      shutdown,
      handle,
    }
  }

  /// Ask for a run as soon as possible. Ignored while offline.
  pub fn request(&self) {
    let _ = self.requests.send(());
  }

  /// Stop the task and wait for an in-progress run to finish.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    if let Err(e) = self.handle.await {
      tracing::error!("Sync scheduler task failed: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::clock::SystemClock;
  use crate::db::Database;
  use crate::queue::{Action, MutationQueue, WriteMemoryPayload};
  use crate::testing::MockRemote;

  fn setup() -> (Arc<SyncManager>, MutationQueue, Arc<MockRemote>) {
    let db = Arc::new(Database::in_memory().unwrap());
    let cache = CacheStore::new(db.clone(), Arc::new(SystemClock));
    let queue = MutationQueue::new(db, Arc::new(SystemClock));
    let remote = Arc::new(MockRemote::new());
    let manager = Arc::new(SyncManager::new(
      queue.clone(),
      cache,
      remote.clone(),
      3,
    ));
    (manager, queue, remote)
  }

  fn set(key: &str) -> Action {
    Action::WriteMemory(WriteMemoryPayload {
      agent_id: "agent-1".to_string(),
      key: key.to_string(),
      value: "v".to_string(),
    })
  }

  async fn wait_for_empty(queue: &MutationQueue) -> bool {
    for _ in 0..100 {
      if queue.pending_count().unwrap() == 0 {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_runs_on_reconnect() {
    let (manager, queue, remote) = setup();
    let connectivity = ConnectivityMonitor::new(false);
    queue.enqueue(&set("a")).unwrap();

    let scheduler = SyncScheduler::spawn(
      manager,
      connectivity.clone(),
      Duration::from_secs(3600),
      None,
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(remote.calls().is_empty());

    connectivity.set_online(true);
    assert!(wait_for_empty(&queue).await);
    assert_eq!(remote.calls(), vec!["set_memory agent-1 a".to_string()]);

    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_interval_runs_while_online() {
    let (manager, queue, remote) = setup();
    let connectivity = ConnectivityMonitor::new(true);

    let scheduler = SyncScheduler::spawn(
      manager,
      connectivity,
      Duration::from_millis(20),
      None,
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    queue.enqueue(&set("a")).unwrap();

    assert!(wait_for_empty(&queue).await);
    assert_eq!(remote.calls().len(), 1);

    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_requested_run_is_skipped_offline() {
    let (manager, queue, remote) = setup();
    let connectivity = ConnectivityMonitor::new(false);
    queue.enqueue(&set("a")).unwrap();

    let scheduler = SyncScheduler::spawn(
      manager,
      connectivity,
      Duration::from_millis(20),
      None,
    );
    scheduler.request();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(remote.calls().is_empty());
    assert_eq!(queue.pending_count().unwrap(), 1);

    scheduler.shutdown().await;
  }
}
