//! SQLite-backed cache store.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::traits::{CacheChange, CacheSnapshot, Cacheable};
use crate::clock::Clock;
use crate::db::{parse_datetime, Database};
use crate::error::{Error, Result};
use crate::remote::types::{Agent, ChatMessage, Memory, MemoryNode};

/// Capacity of the change notification channel. Slow subscribers that fall
/// further behind than this just re-read the latest snapshot.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Cache of remote entities, one table per entity kind.
///
/// Cloning is cheap and every clone shares the same database and change
/// channel.
#[derive(Clone)]
pub struct CacheStore {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
  changes: broadcast::Sender<CacheChange>,
  /// Per (entity type, scope) counter of changes other than full refreshes
  generations: Arc<Mutex<HashMap<(&'static str, String), u64>>>,
}

impl CacheStore {
  pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
    let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
    Self {
      db,
      clock,
      changes,
      generations: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Change counter of a scope. A refresh reads it before fetching and hands
  /// it back to [`CacheStore::replace_all_if_unchanged`].
  pub fn generation<T: Cacheable>(&self, scope: &str) -> Result<u64> {
    let generations = self.lock_generations()?;
    Ok(
      generations
        .get(&(T::entity_type(), scope.to_string()))
        .copied()
        .unwrap_or(0),
    )
  }

  /// Record that a scope changed outside of a full refresh, e.g. a queued
  /// write reached the server. In-flight refreshes of the scope are dropped.
  pub fn touch(&self, entity_type: &'static str, scope: &str) -> Result<()> {
    let mut generations = self.lock_generations()?;
    *generations
      .entry((entity_type, scope.to_string()))
      .or_insert(0) += 1;
    Ok(())
  }

  /// Subscribe to change notifications for every entity type and scope.
  pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
    self.changes.subscribe()
  }

  /// Current cached entities for a scope, in snapshot order.
  pub fn get<T: Cacheable>(&self, scope: &str) -> Result<Vec<T>> {
    let conn = self.db.conn()?;
    let sql = format!(
      "SELECT entity_key, data FROM {} WHERE scope = ? ORDER BY position",
      table::<T>()
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map(params![scope], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<std::result::Result<_, _>>()?;

    let entities = rows
      .into_iter()
      .filter_map(|(key, data)| match serde_json::from_slice(&data) {
        Ok(entity) => Some(entity),
        Err(e) => {
          tracing::warn!(
            "Skipping undecodable {} row {} in scope {:?}: {}",
            T::entity_type(),
            key,
            scope,
            e
          );
          None
        }
      })
      .collect();

    Ok(entities)
  }

  /// When the scope was last replaced by a full refresh.
  pub fn refreshed_at<T: Cacheable>(&self, scope: &str) -> Result<Option<DateTime<Utc>>> {
    let conn = self.db.conn()?;
    let stamp: Option<String> = conn
      .query_row(
        "SELECT refreshed_at FROM cache_refresh WHERE entity_type = ? AND scope = ?",
        params![T::entity_type(), scope],
        |row| row.get(0),
      )
      .optional()?;

    stamp.as_deref().map(parse_datetime).transpose()
  }

  /// True if the scope was never refreshed or its last refresh is older than `ttl`.
  pub fn is_stale<T: Cacheable>(&self, scope: &str, ttl: Duration) -> Result<bool> {
    Ok(match self.refreshed_at::<T>(scope)? {
      Some(refreshed_at) => self.clock.now() - refreshed_at > ttl,
      None => true,
    })
  }

  /// Snapshot plus staleness metadata in one call.
  pub fn snapshot<T: Cacheable>(&self, scope: &str, ttl: Duration) -> Result<CacheSnapshot<T>> {
    let data = self.get::<T>(scope)?;
    let refreshed_at = self.refreshed_at::<T>(scope)?;
    let is_stale = match refreshed_at {
      Some(at) => self.clock.now() - at > ttl,
      None => true,
    };

    Ok(CacheSnapshot {
      data,
      refreshed_at,
      is_stale,
    })
  }

  /// Replace the whole scope and stamp its refresh time.
  ///
  /// Runs as a single transaction under the connection lock, so readers see
  /// either the old collection or the new one.
  pub fn replace_all<T: Cacheable>(&self, scope: &str, entities: &[T]) -> Result<()> {
    let table = table::<T>();
    let now = self.clock.now().to_rfc3339();

    {
      let mut conn = self.db.conn()?;
      let tx = conn.transaction()?;

      tx.execute(
        &format!("DELETE FROM {} WHERE scope = ?", table),
        params![scope],
      )?;

      {
        let mut insert = tx.prepare(&format!(
          "INSERT OR REPLACE INTO {} (scope, entity_key, position, data) VALUES (?, ?, ?, ?)",
          table
        ))?;
        for (position, entity) in entities.iter().enumerate() {
          let data = serde_json::to_vec(entity)?;
          insert.execute(params![scope, entity.cache_key(), position as i64, data])?;
        }
      }

      tx.execute(
        "INSERT OR REPLACE INTO cache_refresh (entity_type, scope, refreshed_at) VALUES (?, ?, ?)",
        params![T::entity_type(), scope, now],
      )?;

      tx.commit()?;
    }

    tracing::debug!(
      "Replaced {} scope {:?} with {} entities",
      T::entity_type(),
      scope,
      entities.len()
    );
    self.notify::<T>(scope);
    Ok(())
  }

  /// Like [`CacheStore::replace_all`], but only if the scope's generation is
  /// still `generation`. Returns whether the scope was replaced.
  pub fn replace_all_if_unchanged<T: Cacheable>(
    &self,
    scope: &str,
    entities: &[T],
    generation: u64,
  ) -> Result<bool> {
    // Held across the replace so no change can slip in after the check
    let generations = self.lock_generations()?;
    let current = generations
      .get(&(T::entity_type(), scope.to_string()))
      .copied()
      .unwrap_or(0);
    if current != generation {
      return Ok(false);
    }

    self.replace_all(scope, entities)?;
    drop(generations);
    Ok(true)
  }

  /// Insert or update one entity. New entities go to the end of the scope.
  /// Does not touch the refresh timestamp.
  pub fn upsert_one<T: Cacheable>(&self, scope: &str, entity: &T) -> Result<()> {
    let data = serde_json::to_vec(entity)?;
    self.touch(T::entity_type(), scope)?;
    {
      let conn = self.db.conn()?;
      conn.execute(
        &format!(
          "INSERT INTO {table} (scope, entity_key, position, data)
           VALUES (?1, ?2, (SELECT COALESCE(MAX(position), -1) + 1 FROM {table} WHERE scope = ?1), ?3)
           ON CONFLICT(scope, entity_key) DO UPDATE SET data = excluded.data",
          table = table::<T>()
        ),
        params![scope, entity.cache_key(), data],
      )?;
    }

    self.notify::<T>(scope);
    Ok(())
  }

  /// Swap the row stored under `old_key` for `entity`, keeping its position.
  ///
  /// Used when a provisional id is replaced by the server-assigned one. If a
  /// refresh already brought in the server row, the provisional row is
  /// dropped instead.
  pub fn replace_one<T: Cacheable>(&self, scope: &str, old_key: &str, entity: &T) -> Result<()> {
    let table = table::<T>();
    let new_key = entity.cache_key();
    let data = serde_json::to_vec(entity)?;
    self.touch(T::entity_type(), scope)?;

    let updated = {
      let mut conn = self.db.conn()?;
      let tx = conn.transaction()?;

      let new_exists = old_key != new_key
        && tx
          .query_row(
            &format!("SELECT 1 FROM {} WHERE scope = ? AND entity_key = ?", table),
            params![scope, new_key],
            |_| Ok(()),
          )
          .optional()?
          .is_some();

      if new_exists {
        tx.execute(
          &format!("DELETE FROM {} WHERE scope = ? AND entity_key = ?", table),
          params![scope, old_key],
        )?;
      }

      let target = if new_exists { new_key.as_str() } else { old_key };
      let updated = tx.execute(
        &format!(
          "UPDATE {} SET entity_key = ?, data = ? WHERE scope = ? AND entity_key = ?",
          table
        ),
        params![new_key, data, scope, target],
      )?;

      tx.commit()?;
      updated
    };

    if updated == 0 {
      // Row was removed locally in the meantime; nothing to reconcile
      tracing::debug!(
        "No cached {} row {} in scope {:?} to replace",
        T::entity_type(),
        old_key,
        scope
      );
      return Ok(());
    }

    self.notify::<T>(scope);
    Ok(())
  }

  /// Remove one entity. Returns whether a row was removed.
  pub fn delete_one<T: Cacheable>(&self, scope: &str, key: &str) -> Result<bool> {
    self.touch(T::entity_type(), scope)?;
    let removed = {
      let conn = self.db.conn()?;
      conn.execute(
        &format!("DELETE FROM {} WHERE scope = ? AND entity_key = ?", table::<T>()),
        params![scope, key],
      )?
    };

    if removed > 0 {
      self.notify::<T>(scope);
    }
    Ok(removed > 0)
  }

  /// Drop every cached row of a scope and forget its refresh time.
  pub fn clear_scope<T: Cacheable>(&self, scope: &str) -> Result<()> {
    self.touch(T::entity_type(), scope)?;
    {
      let mut conn = self.db.conn()?;
      let tx = conn.transaction()?;
      tx.execute(
        &format!("DELETE FROM {} WHERE scope = ?", table::<T>()),
        params![scope],
      )?;
      tx.execute(
        "DELETE FROM cache_refresh WHERE entity_type = ? AND scope = ?",
        params![T::entity_type(), scope],
      )?;
      tx.commit()?;
    }

    self.notify::<T>(scope);
    Ok(())
  }

  /// Drop every cached row of every entity kind. Subscribers of every
  /// scope that held data are told.
  pub fn clear_all(&self) -> Result<()> {
    let kinds = [
      Agent::entity_type(),
      ChatMessage::entity_type(),
      Memory::entity_type(),
      MemoryNode::entity_type(),
    ];

    let mut cleared = Vec::new();
    {
      let conn = self.db.conn()?;
      for kind in kinds {
        let mut stmt = conn.prepare(&format!(
          "SELECT DISTINCT scope FROM cached_{kind}
           UNION SELECT scope FROM cache_refresh WHERE entity_type = ?1",
          kind = kind
        ))?;
        let scopes: Vec<String> = stmt
          .query_map(params![kind], |row| row.get(0))?
          .collect::<std::result::Result<_, _>>()?;
        cleared.extend(scopes.into_iter().map(|scope| (kind, scope)));
      }
    }

    for (kind, scope) in &cleared {
      self.touch(*kind, scope)?;
    }

    {
      let mut conn = self.db.conn()?;
      let tx = conn.transaction()?;
      for kind in kinds {
        tx.execute(&format!("DELETE FROM cached_{}", kind), [])?;
      }
      tx.execute("DELETE FROM cache_refresh", [])?;
      tx.commit()?;
    }

    for (kind, scope) in cleared {
      self.send_change(kind, scope);
    }

    tracing::info!("Cleared all cached entities");
    Ok(())
  }

  fn notify<T: Cacheable>(&self, scope: &str) {
    self.send_change(T::entity_type(), scope.to_string());
  }

  fn send_change(&self, entity_type: &'static str, scope: String) {
    // No receivers is fine
    let _ = self.changes.send(CacheChange { entity_type, scope });
  }

  fn lock_generations(&self) -> Result<MutexGuard<'_, HashMap<(&'static str, String), u64>>> {
    self
      .generations
      .lock()
      .map_err(|e| Error::Corrupt(format!("Lock poisoned: {}", e)))
  }
}

fn table<T: Cacheable>() -> String {
  format!("cached_{}", T::entity_type())
}
