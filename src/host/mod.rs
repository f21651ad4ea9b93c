//! Debugger Host Abstraction
//!
//! The capture core talks to the browser only through [`DebuggerHost`] and
//! the [`HostEvent`] stream. Implementations:
//! - `cdp`: Chrome DevTools Protocol over a websocket
//! - `mock`: recording host for tests

pub mod cdp;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::types::{LifecycleEvent, ResponseBody, TabId, TabInfo};

pub use cdp::CdpHost;

/// Host errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Target already has a debugger attached: {0}")]
    AlreadyAttached(String),

    #[error("Unknown tab: {0}")]
    UnknownTab(TabId),

    #[error("Tab {0} has no debugger session")]
    NotAttached(TabId),

    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for HostError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        HostError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for HostError {
    fn from(err: reqwest::Error) -> Self {
        HostError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::InvalidResponse(err.to_string())
    }
}

/// Result type alias for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Key event direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyEventKind {
    KeyDown,
    KeyUp,
}

/// Synthetic keyboard input for a tab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub key: String,
    pub code: String,
    pub windows_virtual_key_code: u32,
}

impl KeyEvent {
    pub fn page_down(kind: KeyEventKind) -> Self {
        Self {
            kind,
            key: "PageDown".to_string(),
            code: "PageDown".to_string(),
            windows_virtual_key_code: 34,
        }
    }
}

/// One intercepted request/response pair waiting to be resumed.
///
/// Not `Clone`: [`InterceptedExchange::resume`] consumes it, so an exchange
/// cannot be continued twice.
#[derive(Debug, PartialEq, Eq)]
pub struct InterceptedExchange {
    pub tab_id: TabId,
    pub interception_id: String,
    pub request_url: String,
}

impl InterceptedExchange {
    pub fn new(tab_id: TabId, interception_id: impl Into<String>, request_url: impl Into<String>) -> Self {
        Self {
            tab_id,
            interception_id: interception_id.into(),
            request_url: request_url.into(),
        }
    }

    /// Let the page's request continue
    pub async fn resume(self, host: &dyn DebuggerHost) -> HostResult<()> {
        host.continue_exchange(self.tab_id, &self.interception_id).await
    }
}

/// Events pushed by the host
#[derive(Debug)]
pub enum HostEvent {
    Lifecycle(LifecycleEvent),
    Intercepted(InterceptedExchange),
    /// Connection to the browser is gone; no further events will arrive
    Disconnected,
}

/// Debugger host trait - the browser operations the capture core needs
#[async_trait]
pub trait DebuggerHost: Send + Sync {
    /// Attach a debugging session to the tab
    async fn attach(&self, tab_id: TabId) -> HostResult<()>;

    /// Detach from the tab; detaching a tab with no session succeeds
    async fn detach(&self, tab_id: TabId) -> HostResult<()>;

    /// Enable network events for an attached tab
    async fn enable_network(&self, tab_id: TabId) -> HostResult<()>;

    /// Intercept responses whose URL matches `url_pattern`
    async fn set_interception_filter(&self, tab_id: TabId, url_pattern: &str) -> HostResult<()>;

    /// Fetch the response body of an intercepted exchange
    async fn get_response_body(&self, tab_id: TabId, interception_id: &str) -> HostResult<ResponseBody>;

    /// Resume an intercepted exchange unchanged
    async fn continue_exchange(&self, tab_id: TabId, interception_id: &str) -> HostResult<()>;

    /// All open tabs
    async fn list_tabs(&self) -> HostResult<Vec<TabInfo>>;

    /// Deliver a synthetic key event to an attached tab
    async fn dispatch_key(&self, tab_id: TabId, event: KeyEvent) -> HostResult<()>;

    /// Host type name
    fn host_type(&self) -> &'static str;
}
