//! Durable FIFO of writes that still have to reach the remote service.

mod action;
mod store;

pub use action::{
  Action, ActionType, CarePayload, DeleteMemoryPayload, DeleteNotePayload, SendMessagePayload,
  WriteMemoryPayload, WriteNotePayload,
};
pub use store::{MutationQueue, QueuedAction};

/// Failed replay attempts after which a queued action is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 3;
