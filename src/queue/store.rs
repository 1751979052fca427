//! SQLite-backed mutation queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use super::action::{Action, ActionType};
use crate::clock::Clock;
use crate::db::{parse_datetime, Database};
use crate::error::Result;

/// One pending write as stored in `offline_actions`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAction {
  /// Monotonic, assigned in enqueue order
  pub id: i64,
  pub action_type: String,
  /// Opaque JSON payload
  pub payload: String,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub last_error: Option<String>,
}

impl QueuedAction {
  /// Decode the stored type tag and payload.
  pub fn action(&self) -> Result<Action> {
    let action_type: ActionType = self.action_type.parse()?;
    Action::decode(action_type, &self.payload)
  }
}

/// Durable, ordered log of writes waiting for replay.
///
/// Replay order is enqueue order, which the AUTOINCREMENT id preserves even
/// across restarts and clock adjustments.
#[derive(Clone)]
pub struct MutationQueue {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
}

impl MutationQueue {
  pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
    Self { db, clock }
  }

  /// Append an action. Fails only if local storage does.
  pub fn enqueue(&self, action: &Action) -> Result<i64> {
    let payload = action.encode_payload()?;
    let now = self.clock.now().to_rfc3339();

    let id = {
      let conn = self.db.conn()?;
      conn.execute(
        "INSERT INTO offline_actions (action_type, payload, created_at, retry_count)
         VALUES (?, ?, ?, 0)",
        params![action.action_type().as_str(), payload, now],
      )?;
      conn.last_insert_rowid()
    };

    tracing::debug!("Queued {} action {}", action.action_type(), id);
    Ok(id)
  }

  /// All pending actions, oldest first. Does not remove anything.
  pub fn drain(&self) -> Result<Vec<QueuedAction>> {
    let conn = self.db.conn()?;
    select_actions(&conn, "1 = 1", params![])
  }

  /// Remove a successfully replayed action.
  pub fn mark_done(&self, id: i64) -> Result<()> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM offline_actions WHERE id = ?", params![id])?;
    Ok(())
  }

  /// Record a failed replay attempt.
  pub fn increment_retry(&self, id: i64, error: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn.execute(
      "UPDATE offline_actions
       SET retry_count = retry_count + 1,
           last_error = ?
       WHERE id = ?",
      params![error, id],
    )?;
    Ok(())
  }

  /// Drop every action that has failed `max_retries` times or more.
  /// Returns the dropped actions, oldest first.
  pub fn prune_exhausted(&self, max_retries: u32) -> Result<Vec<QueuedAction>> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;
    let pruned = select_actions(&tx, "retry_count >= ?", params![max_retries])?;
    tx.execute(
      "DELETE FROM offline_actions WHERE retry_count >= ?",
      params![max_retries],
    )?;
    tx.commit()?;

    if !pruned.is_empty() {
      tracing::warn!(
        "Dropped {} queued action(s) after {} failed attempts",
        pruned.len(),
        max_retries
      );
    }
    Ok(pruned)
  }

  /// Number of actions waiting for replay.
  pub fn pending_count(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM offline_actions", [], |row| {
      row.get(0)
    })?;
    Ok(count as usize)
  }

  /// Drop every pending action and id mapping. Returns how many actions were dropped.
  pub fn clear(&self) -> Result<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;
    let dropped = tx.execute("DELETE FROM offline_actions", [])?;
    tx.execute("DELETE FROM id_mappings", [])?;
    tx.commit()?;
    Ok(dropped)
  }

  /// Remember which server id a provisional id turned into.
  pub fn record_id_mapping(&self, local_id: &str, server_id: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO id_mappings (local_id, server_id, created_at) VALUES (?, ?, ?)",
      params![local_id, server_id, self.clock.now().to_rfc3339()],
    )?;
    Ok(())
  }

  /// Record that `local_id` became `server_id` and rewrite every pending
  /// action that still refers to the provisional id, atomically.
  /// Returns how many pending actions were rewritten.
  pub fn reconcile_id(&self, local_id: &str, server_id: &str) -> Result<usize> {
    let pending = self.drain()?;

    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR REPLACE INTO id_mappings (local_id, server_id, created_at) VALUES (?, ?, ?)",
      params![local_id, server_id, self.clock.now().to_rfc3339()],
    )?;

    let mut rewritten = 0;
    for queued in pending {
      let Ok(mut action) = queued.action() else {
        continue;
      };
      if action.rewrite_id(local_id, server_id) {
        tx.execute(
          "UPDATE offline_actions SET payload = ? WHERE id = ?",
          params![action.encode_payload()?, queued.id],
        )?;
        rewritten += 1;
      }
    }
    tx.commit()?;

    if rewritten > 0 {
      tracing::debug!("Rewrote {} queued action(s) for {} -> {}", rewritten, local_id, server_id);
    }
    Ok(rewritten)
  }

  /// Server id for a provisional id, if its create has been replayed.
  pub fn resolve_id(&self, local_id: &str) -> Result<Option<String>> {
    let conn = self.db.conn()?;
    let server_id = conn
      .query_row(
        "SELECT server_id FROM id_mappings WHERE local_id = ?",
        params![local_id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(server_id)
  }

  /// Whether a create for this provisional id is still waiting in the queue.
  pub fn has_pending_create(&self, local_id: &str) -> Result<bool> {
    Ok(self.drain()?.iter().any(|queued| {
      queued
        .action()
        .map(|action| action.creates_local_id() == Some(local_id))
        .unwrap_or(false)
    }))
  }
}

fn select_actions(
  conn: &Connection,
  filter: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<QueuedAction>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT id, action_type, payload, created_at, retry_count, last_error
     FROM offline_actions
     WHERE {}
     ORDER BY id ASC",
    filter
  ))?;

  let rows: Vec<(i64, String, String, String, u32, Option<String>)> = stmt
    .query_map(params, |row| {
      Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
      ))
    })?
    .collect::<std::result::Result<_, _>>()?;

  rows
    .into_iter()
    .map(
      |(id, action_type, payload, created_at, retry_count, last_error)| {
        Ok(QueuedAction {
          id,
          action_type,
          payload,
          created_at: parse_datetime(&created_at)?,
          retry_count,
          last_error,
        })
      },
    )
    .collect()
}
