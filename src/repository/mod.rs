//! Read/write facade per entity kind.
//!
//! A [`Repository`] composes the cache store, the mutation queue, the
//! connectivity monitor and a remote lister:
//!
//! - reads answer from the cache immediately and refresh stale scopes in the
//!   background
//! - writes and deletes are applied to the cache first, then sent live when
//!   online, or queued for the sync manager when offline or when the live
//!   call fails
//!
//! Refreshes never clobber local writes that have not reached the server:
//! pending queued actions are re-applied to every fetched list, and a fetch
//! that overlapped any change to its scope (a local write or a replayed
//! queued action) is thrown away.

mod agents;
mod chat;
mod memories;
mod notes;

pub use agents::AgentRepository;
pub use chat::ChatRepository;
pub use memories::MemoryRepository;
pub use notes::NoteRepository;

use chrono::Duration;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;

use crate::cache::{CacheSnapshot, CacheStore, Cacheable};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, ErrorKind, Result};
use crate::queue::{Action, MutationQueue};
use crate::remote::types::is_provisional;

/// A cacheable entity that knows how queued actions affect it.
pub trait Entity: Cacheable {
  /// Re-apply a queued action that has not replayed yet to a freshly
  /// fetched list for `scope`.
  fn apply_pending(items: &mut Vec<Self>, scope: &str, action: &Action);
}

/// What happened to a write after the optimistic cache update.
#[derive(Debug)]
pub enum WriteOutcome<T> {
  /// Confirmed by the remote service. Deletes carry no entity.
  Sent(Option<T>),
  /// Stored in the offline queue. `cause` is the live-call failure, reported
  /// once; `None` when the device was offline and no call was attempted.
  Queued { action_id: i64, cause: Option<Error> },
}

impl<T> WriteOutcome<T> {
  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued { .. })
  }
}

/// Local effect of a write, applied before any network traffic.
#[derive(Debug, Clone)]
pub(crate) enum LocalChange<T> {
  Upsert(T),
  Delete(String),
  Nothing,
}

type ListFn<T> = Box<dyn Fn(String) -> BoxFuture<'static, Result<Vec<T>>> + Send + Sync>;

/// Generic offline-first repository for one entity kind.
///
/// Cloning is cheap; clones share state.
pub struct Repository<T: Entity> {
  inner: Arc<Inner<T>>,
}

impl<T: Entity> Clone for Repository<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct Inner<T: Entity> {
  cache: CacheStore,
  queue: MutationQueue,
  connectivity: ConnectivityMonitor,
  lister: ListFn<T>,
  ttl: Duration,
  /// Serializes local mutations against applying a refresh
  local_writes: Mutex<()>,
  /// Scopes with a background refresh in flight
  refreshing: Mutex<HashSet<String>>,
}

impl<T: Entity> Repository<T> {
  /// Create a repository. `lister` fetches the full remote list for a scope.
  pub fn new<F, Fut>(
    cache: CacheStore,
    queue: MutationQueue,
    connectivity: ConnectivityMonitor,
    ttl: Duration,
    lister: F,
  ) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    Self {
      inner: Arc::new(Inner {
        cache,
        queue,
        connectivity,
        lister: Box::new(move |scope| lister(scope).boxed()),
        ttl,
        local_writes: Mutex::new(()),
        refreshing: Mutex::new(HashSet::new()),
      }),
    }
  }

  pub fn ttl(&self) -> Duration {
    self.inner.ttl
  }

  /// Current cached view of a scope.
  ///
  /// Never waits on the network. If the scope is stale and we are online, a
  /// background refresh is spawned; its result reaches [`Self::subscribe`]rs.
  pub fn read(&self, scope: &str) -> Result<CacheSnapshot<T>> {
    let snapshot = self.inner.cache.snapshot::<T>(scope, self.inner.ttl)?;
    if snapshot.is_stale && self.inner.connectivity.is_online() {
      self.spawn_refresh(scope);
    }
    Ok(snapshot)
  }

  /// Fetch the scope from the remote service and replace the cache with it.
  ///
  /// On failure the cache is left untouched and the error is returned.
  pub async fn refresh(&self, scope: &str) -> Result<()> {
    self.inner.refresh(scope).await
  }

  /// Live stream of snapshots for a scope.
  ///
  /// Yields the current snapshot first, then a new one after every change to
  /// the scope. Never ends; drop it to unsubscribe and subscribe again to
  /// restart.
  pub fn subscribe(&self, scope: &str) -> impl Stream<Item = Vec<T>> + Send + 'static {
    // Subscribe before reading so no change between the two is missed
    let changes = self.inner.cache.changes();
    let initial = match self.read(scope) {
      Ok(snapshot) => snapshot.data,
      Err(e) => {
        tracing::warn!("Failed to read {} {:?}: {}", T::entity_type(), scope, e);
        Vec::new()
      }
    };

    let state = (Some(initial), changes, self.inner.cache.clone(), scope.to_string());
    futures::stream::unfold(state, |(first, mut changes, cache, scope)| async move {
      if let Some(first) = first {
        return Some((first, (None, changes, cache, scope)));
      }

      loop {
        match changes.recv().await {
          Ok(change) if change.entity_type == T::entity_type() && change.scope == scope => break,
          Ok(_) => continue,
          // Missed some notifications; re-reading catches up
          Err(RecvError::Lagged(_)) => break,
          Err(RecvError::Closed) => return None,
        }
      }

      match cache.get::<T>(&scope) {
        Ok(items) => Some((items, (None, changes, cache, scope))),
        Err(e) => {
          tracing::warn!("Subscription for {} {:?} ended: {}", T::entity_type(), scope, e);
          None
        }
      }
    })
  }

  /// Optimistically insert or update `item`, then propagate it.
  ///
  /// `send` performs the live call and returns the server's version of the
  /// entity; it is only invoked when online.
  pub async fn write<F, Fut>(
    &self,
    scope: &str,
    item: T,
    action: Action,
    send: F,
  ) -> Result<WriteOutcome<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self
      .submit(scope, LocalChange::Upsert(item), action, || async move {
        send().await.map(Some)
      })
      .await
  }

  /// Optimistically remove `id`, then propagate the delete.
  ///
  /// The local removal happens regardless of connectivity. Provisional ids
  /// are always queued so the delete replays after the queued create.
  pub async fn delete<F, Fut>(
    &self,
    scope: &str,
    id: &str,
    action: Action,
    send: F,
  ) -> Result<WriteOutcome<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    let local = LocalChange::Delete(id.to_string());
    if is_provisional(id) {
      self.apply_local(scope, &local)?;
      let action_id = self.enqueue(scope, &local, &action)?;
      return Ok(WriteOutcome::Queued {
        action_id,
        cause: None,
      });
    }

    self
      .submit(scope, local, action, || async move {
        send().await.map(|()| None)
      })
      .await
  }

  /// Drop the cached scope (unpairing, switching agent).
  pub fn invalidate(&self, scope: &str) -> Result<()> {
    let _guard = self.inner.lock_writes()?;
    self.inner.cache.clear_scope::<T>(scope)
  }

  pub(crate) async fn submit<F, Fut>(
    &self,
    scope: &str,
    local: LocalChange<T>,
    action: Action,
    send: F,
  ) -> Result<WriteOutcome<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
  {
    self.apply_local(scope, &local)?;

    if !self.inner.connectivity.is_online() {
      let action_id = self.enqueue(scope, &local, &action)?;
      tracing::debug!("Offline, queued {} as {}", action.action_type(), action_id);
      return Ok(WriteOutcome::Queued {
        action_id,
        cause: None,
      });
    }

    match send().await {
      Ok(confirmed) => {
        if let Some(confirmed) = &confirmed {
          self.confirm(scope, &local, confirmed)?;
        }
        Ok(WriteOutcome::Sent(confirmed))
      }
      Err(e) => {
        let action_id = self.enqueue(scope, &local, &action)?;
        match e.kind() {
          ErrorKind::Transient => {
            tracing::warn!(
              "Live {} failed, queued as {}: {}",
              action.action_type(),
              action_id,
              e
            );
            Ok(WriteOutcome::Queued {
              action_id,
              cause: Some(e),
            })
          }
          ErrorKind::Unauthorized | ErrorKind::Fatal => Err(e),
        }
      }
    }
  }

  fn apply_local(&self, scope: &str, local: &LocalChange<T>) -> Result<()> {
    let _guard = self.inner.lock_writes()?;
    self.inner.bump(scope)?;
    self.inner.apply(scope, local)
  }

  /// Queue the action and re-apply its local effect in the same critical
  /// section, in case a refresh replaced the scope while the live call ran.
  fn enqueue(&self, scope: &str, local: &LocalChange<T>, action: &Action) -> Result<i64> {
    let _guard = self.inner.lock_writes()?;
    self.inner.bump(scope)?;
    let action_id = self.inner.queue.enqueue(action)?;
    self.inner.apply(scope, local)?;
    Ok(action_id)
  }

  /// Swap the optimistic row for the server's version.
  fn confirm(&self, scope: &str, local: &LocalChange<T>, confirmed: &T) -> Result<()> {
    let _guard = self.inner.lock_writes()?;
    match local {
      LocalChange::Upsert(item) if item.cache_key() != confirmed.cache_key() => {
        self
          .inner
          .cache
          .replace_one(scope, &item.cache_key(), confirmed)
      }
      _ => self.inner.cache.upsert_one(scope, confirmed),
    }
  }

  fn spawn_refresh(&self, scope: &str) {
    let handle = match tokio::runtime::Handle::try_current() {
      Ok(handle) => handle,
      Err(_) => {
        tracing::debug!("No runtime, skipping background refresh of {:?}", scope);
        return;
      }
    };

    {
      let Ok(mut refreshing) = self.inner.refreshing.lock() else {
        return;
      };
      if !refreshing.insert(scope.to_string()) {
        // Already in flight
        return;
      }
    }

    let slot = RefreshSlot {
      inner: Arc::clone(&self.inner),
      scope: scope.to_string(),
    };
    handle.spawn(async move {
      if let Err(e) = slot.inner.refresh(&slot.scope).await {
        tracing::warn!(
          "Background refresh of {} {:?} failed: {}",
          T::entity_type(),
          slot.scope,
          e
        );
      }
    });
  }
}

/// Marks a scope's background refresh as finished when dropped, including
/// when the refresh task panics.
struct RefreshSlot<T: Entity> {
  inner: Arc<Inner<T>>,
  scope: String,
}

impl<T: Entity> Drop for RefreshSlot<T> {
  fn drop(&mut self) {
    let mut refreshing = self
      .inner
      .refreshing
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    refreshing.remove(&self.scope);
  }
}

impl<T: Entity> Inner<T> {
  async fn refresh(&self, scope: &str) -> Result<()> {
    let generation = self.cache.generation::<T>(scope)?;
    let mut items = (self.lister)(scope.to_string()).await?;

    let _guard = self.lock_writes()?;
    for queued in self.queue.drain()? {
      match queued.action() {
        Ok(action) => T::apply_pending(&mut items, scope, &action),
        Err(e) => tracing::debug!("Skipping undecodable queued action {}: {}", queued.id, e),
      }
    }

    if !self.cache.replace_all_if_unchanged(scope, &items, generation)? {
      // The scope changed while we were fetching; the list may predate it
      tracing::debug!(
        "Discarding refresh of {} {:?} that overlapped a write",
        T::entity_type(),
        scope
      );
    }
    Ok(())
  }

  fn apply(&self, scope: &str, local: &LocalChange<T>) -> Result<()> {
    match local {
      LocalChange::Upsert(item) => self.cache.upsert_one(scope, item),
      LocalChange::Delete(id) => self.cache.delete_one::<T>(scope, id).map(|_| ()),
      LocalChange::Nothing => Ok(()),
    }
  }

  /// Invalidate in-flight refreshes of `scope`, also for changes that do
  /// not touch the cache themselves.
  fn bump(&self, scope: &str) -> Result<()> {
    self.cache.touch(T::entity_type(), scope)
  }

  fn lock_writes(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
    self
      .local_writes
      .lock()
      .map_err(|e| Error::Corrupt(format!("Lock poisoned: {}", e)))
  }
}

/// Insert or replace by cache key, keeping position for existing items.
pub(crate) fn upsert_by_key<T: Cacheable>(items: &mut Vec<T>, item: T) {
  let key = item.cache_key();
  match items.iter().position(|existing| existing.cache_key() == key) {
    Some(index) => items[index] = item,
    None => items.push(item),
  }
}
