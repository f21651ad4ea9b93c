//! Comment Capture Module
//!
//! Per-tab capture sessions for a single tracked site:
//! - Lifecycle coordinator owning every session transition
//! - Concurrent registry (DashMap) for snapshot reads
//! - Interception gateway that resumes each exchange exactly once
//! - Per-session dedup buffer, reset whenever the tab moves to a new subject

pub mod buffer;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod events;
pub mod gateway;
pub mod registry;
pub mod scroll;
pub mod service;
pub mod site;
pub mod state;
pub mod types;

pub use buffer::DedupBuffer;
pub use error::{CaptureError, CaptureResult};
pub use events::{CaptureEvent, CaptureEventEmitter};
pub use registry::{SessionRegistry, Snapshot};
pub use service::{CaptureHandle, CaptureOptions, CaptureService};
pub use site::SiteMatcher;
pub use state::{AttachmentState, ScrollState, SessionInfo};
pub use types::{Comment, LifecycleEvent, TabId};
