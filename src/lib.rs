//! agentsync - offline-first cache, mutation queue and replay engine for
//! agent, chat and memory data.
//!
//! Reads are served from a local SQLite cache and refreshed in the
//! background once stale. Writes land in the cache first and are sent live
//! when the device is online, or queued and replayed in order later.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod db;
pub mod error;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod sync;

#[cfg(test)]
mod testing;

pub use context::SyncContext;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use repository::WriteOutcome;
pub use sync::{SyncManager, SyncReport};
