//! Capture Events
//!
//! Push notifications for observers of the capture registry (the UI socket,
//! tests, the log).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::state::AttachmentState;
use super::types::TabId;

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// New comments were merged; `count` is the new buffer size
    CommentsUpdated {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        count: usize,
    },

    /// Attachment state of a tab changed
    StateChanged {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        #[serde(rename = "oldState")]
        old_state: AttachmentState,
        #[serde(rename = "newState")]
        new_state: AttachmentState,
    },

    /// Tab moved to a different subject and its buffer was emptied
    SubjectReset {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        #[serde(rename = "subjectKey")]
        subject_key: String,
    },

    /// Active tab changed
    ActiveTabChanged {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
}

impl CaptureEvent {
    /// Tab the event refers to
    pub fn tab_id(&self) -> TabId {
        match self {
            Self::CommentsUpdated { tab_id, .. } => *tab_id,
            Self::StateChanged { tab_id, .. } => *tab_id,
            Self::SubjectReset { tab_id, .. } => *tab_id,
            Self::ActiveTabChanged { tab_id } => *tab_id,
        }
    }

    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CommentsUpdated { .. } => "comments_updated",
            Self::StateChanged { .. } => "state_changed",
            Self::SubjectReset { .. } => "subject_reset",
            Self::ActiveTabChanged { .. } => "active_tab_changed",
        }
    }
}

/// Broadcast fan-out for capture events
#[derive(Debug, Clone)]
pub struct CaptureEventEmitter {
    event_tx: broadcast::Sender<CaptureEvent>,
}

impl CaptureEventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.event_tx.subscribe()
    }

    /// Send to all current subscribers; having none is not an error
    pub fn emit(&self, event: CaptureEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit_comments_updated(&self, tab_id: TabId, count: usize) {
        self.emit(CaptureEvent::CommentsUpdated { tab_id, count });
    }

    pub fn emit_state_changed(&self, tab_id: TabId, old_state: AttachmentState, new_state: AttachmentState) {
        if old_state != new_state {
            self.emit(CaptureEvent::StateChanged {
                tab_id,
                old_state,
                new_state,
            });
        }
    }
}

impl Default for CaptureEventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
