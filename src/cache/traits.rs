//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::remote::types::{Agent, ChatMessage, Memory, MemoryNode};

/// Trait for entities that can be cached.
///
/// Implementors provide a cache key that is unique within one scope and an
/// entity type name that selects the `cached_<entity_type>` table.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity within its scope
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g., "agents", "messages")
  fn entity_type() -> &'static str;
}

/// A cached collection as seen by a reader.
#[derive(Debug, Clone)]
pub struct CacheSnapshot<T> {
  /// The cached entities in order
  pub data: Vec<T>,
  /// When the scope was last fully refreshed, if ever
  pub refreshed_at: Option<DateTime<Utc>>,
  /// Whether the snapshot is older than the repository's TTL
  pub is_stale: bool,
}

/// Emitted after any write to a cached scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
  pub entity_type: &'static str,
  pub scope: String,
}

impl Cacheable for Agent {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "agents"
  }
}

impl Cacheable for ChatMessage {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "messages"
  }
}

impl Cacheable for Memory {
  fn cache_key(&self) -> String {
    self.key.clone()
  }

  fn entity_type() -> &'static str {
    "memories"
  }
}

impl Cacheable for MemoryNode {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "memory_nodes"
  }
}
