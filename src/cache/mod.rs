//! Generic caching layer for data persistence and offline support.
//!
//! This module provides an entity-agnostic cache that:
//! - Stores one table of records per entity kind, scoped by a key (e.g. agent id)
//! - Replaces a whole scope atomically on refresh and stamps the refresh time
//! - Answers TTL staleness checks per scope
//! - Supports fine-grained optimistic upserts and deletes
//! - Broadcasts a change notification after every write

mod store;
mod traits;

pub use store::CacheStore;
pub use traits::{CacheChange, CacheSnapshot, Cacheable};
