use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the sync engine and its data source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// The fetch did not complete before the deadline.
  #[error("request timed out after {}s", .after.as_secs())]
  Timeout { after: Duration },

  /// Transport or connectivity failure talking to the data source.
  #[error("network error: {0}")]
  Network(String),

  /// A mutation was attempted while the connectivity signal reports offline.
  #[error("you are offline; changes cannot be saved until the connection returns")]
  Offline,

  /// The data source answered with an application-level error.
  #[error("rejected by server ({status}): {message}")]
  Rejected { status: u16, message: String },
}

/// Error classes the retry policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Timeout,
  Other,
}

impl SyncError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Timeout { .. } => ErrorKind::Timeout,
      _ => ErrorKind::Other,
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, Self::Timeout { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_timeout_message_mentions_threshold() {
    let err = SyncError::Timeout {
      after: Duration::from_secs(45),
    };
    assert_eq!(err.to_string(), "request timed out after 45s");
    assert_eq!(err.kind(), ErrorKind::Timeout);
  }

  #[test]
  fn test_other_kinds() {
    assert_eq!(SyncError::Network("reset".into()).kind(), ErrorKind::Other);
    assert_eq!(SyncError::Offline.kind(), ErrorKind::Other);
    let rejected = SyncError::Rejected {
      status: 400,
      message: "bad filter".into(),
    };
    assert!(!rejected.is_timeout());
    assert_eq!(rejected.to_string(), "rejected by server (400): bad filter");
  }
}
