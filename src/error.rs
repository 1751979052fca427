//! Error types for the sync layer.
//!
//! Every failure is classified into an [`ErrorKind`] so callers can decide
//! what is safe to ignore. Transient failures are recovered by queueing and
//! replay; authorization failures need re-pairing; fatal failures mean local
//! storage can no longer be trusted.

use thiserror::Error;

/// Sync layer error type
#[derive(Error, Debug)]
pub enum Error {
  /// Transport failure: unreachable host, connection reset, DNS
  #[error("Network error: {0}")]
  Network(String),

  /// The request did not complete within its timeout
  #[error("Request timed out: {0}")]
  Timeout(String),

  /// 5xx from the remote service
  #[error("Server error: HTTP {0}")]
  Server(u16),

  /// Non-auth 4xx from the remote service
  #[error("Request rejected: HTTP {status}: {message}")]
  Rejected { status: u16, message: String },

  /// The remote answered but the body could not be decoded
  #[error("Malformed response: {0}")]
  Malformed(String),

  /// No live call was attempted because the device is offline
  #[error("Offline")]
  Offline,

  /// Credential rejected or missing
  #[error("Unauthorized: {0}")]
  Unauthorized(String),

  /// Local database failure
  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// Local data that no longer decodes
  #[error("Corrupt local data: {0}")]
  Corrupt(String),

  /// Invalid local setup (bad URL, missing directory)
  #[error("Configuration error: {0}")]
  Config(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Recovered by queueing and later replay
  Transient,
  /// Credential must be replaced before any further remote call succeeds
  Unauthorized,
  /// Local state is broken; the operation cannot continue
  Fatal,
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Network(_)
      | Error::Timeout(_)
      | Error::Server(_)
      | Error::Rejected { .. }
      | Error::Malformed(_)
      | Error::Offline => ErrorKind::Transient,
      Error::Unauthorized(_) => ErrorKind::Unauthorized,
      Error::Storage(_) | Error::Corrupt(_) | Error::Config(_) => ErrorKind::Fatal,
    }
  }

  pub fn is_transient(&self) -> bool {
    self.kind() == ErrorKind::Transient
  }

  pub fn is_unauthorized(&self) -> bool {
    self.kind() == ErrorKind::Unauthorized
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Corrupt(e.to_string())
  }
}

/// Result type alias for sync layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Explicit opt-in for dropping transient failures.
pub trait ResultExt<T> {
  /// Turn a transient failure into `Ok(None)`. Unauthorized and fatal
  /// errors are passed through unchanged.
  fn ignore_transient(self) -> Result<Option<T>>;
}

impl<T> ResultExt<T> for Result<T> {
  fn ignore_transient(self) -> Result<Option<T>> {
    match self {
      Ok(value) => Ok(Some(value)),
      Err(e) if e.is_transient() => {
        tracing::debug!("Ignoring transient failure: {}", e);
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classification() {
    assert_eq!(Error::Server(503).kind(), ErrorKind::Transient);
    assert_eq!(
      Error::Malformed("eof".to_string()).kind(),
      ErrorKind::Transient
    );
    assert_eq!(
      Error::Unauthorized("401".to_string()).kind(),
      ErrorKind::Unauthorized
    );
    assert_eq!(Error::Corrupt("bad".to_string()).kind(), ErrorKind::Fatal);
  }

  #[test]
  fn test_ignore_transient_keeps_fatal() {
    let transient: Result<u32> = Err(Error::Timeout("read".to_string()));
    assert!(matches!(transient.ignore_transient(), Ok(None)));

    let ok: Result<u32> = Ok(7);
    assert!(matches!(ok.ignore_transient(), Ok(Some(7))));

    let fatal: Result<u32> = Err(Error::Corrupt("payload".to_string()));
    assert!(fatal.ignore_transient().is_err());

    let auth: Result<u32> = Err(Error::Unauthorized("expired".to_string()));
    assert!(auth.ignore_transient().is_err());
  }
}
