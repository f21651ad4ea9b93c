//! Capture Error Types
//!
//! Every variant is recoverable: the worst outcome of any of them is that a
//! single tab stops capturing while the others carry on.

use thiserror::Error;

use super::types::TabId;
use crate::host::HostError;

/// Capture subsystem errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Another debugging client already owns the tab
    #[error("Tab {0} is already attached to another debugger")]
    AttachConflict(TabId),

    /// Intercepted payload could not be decoded
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Any asynchronous host operation reported an error
    #[error("Host call '{operation}' failed for tab {tab_id}: {message}")]
    HostCallFailure {
        tab_id: TabId,
        operation: &'static str,
        message: String,
    },

    /// An event or completion refers to a tab that is no longer tracked
    #[error("Stale event for tab {0}")]
    StaleSession(TabId),

    /// Operation needs an active tab and none is known
    #[error("No active tab")]
    NoActiveTab,

    /// The coordinator task is gone
    #[error("Capture coordinator stopped")]
    CoordinatorStopped,
}

impl CaptureError {
    /// Map a host error for `operation` on `tab_id` into the capture taxonomy
    pub fn from_host(tab_id: TabId, operation: &'static str, err: HostError) -> Self {
        match err {
            HostError::AlreadyAttached(_) => CaptureError::AttachConflict(tab_id),
            other => CaptureError::HostCallFailure {
                tab_id,
                operation,
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::DecodeFailure(format!("invalid JSON: {}", err))
    }
}

impl From<base64::DecodeError> for CaptureError {
    fn from(err: base64::DecodeError) -> Self {
        CaptureError::DecodeFailure(format!("invalid base64: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for CaptureError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CaptureError::DecodeFailure(format!("invalid UTF-8: {}", err))
    }
}

/// Result type alias for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;
