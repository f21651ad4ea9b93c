//! Tab Session State
//!
//! Tracks the capture state of individual browser tabs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::buffer::DedupBuffer;
use super::types::{Comment, TabId};

/// Whether the interception gateway is listening on a tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentState {
    /// No debugger attached, tab not tracked
    Detached,
    /// Attach request in flight
    Attaching,
    /// Debugger attached and interception filter installed
    Attached,
}

impl Default for AttachmentState {
    fn default() -> Self {
        Self::Detached
    }
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detached => write!(f, "detached"),
            Self::Attaching => write!(f, "attaching"),
            Self::Attached => write!(f, "attached"),
        }
    }
}

/// Per-tab pagination helper state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollState {
    pub enabled: bool,
}

/// Monotonic id of one attach attempt.
///
/// Tab ids can be reused by the host; the generation tells a completion for
/// an old attempt apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

/// Where a tab is in giving up its debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachPhase {
    /// Attach `Generation` is still in flight and must settle first
    AwaitingAttach(Generation),
    /// Detach of the debugger from attempt `Generation` has been issued
    Detaching(Generation),
}

impl DetachPhase {
    pub fn generation(&self) -> Generation {
        match self {
            Self::AwaitingAttach(generation) | Self::Detaching(generation) => *generation,
        }
    }
}

/// Target for an attach deferred until the previous debugger is gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttach {
    pub subject_key: String,
    pub url: String,
}

/// Registry entry for a tracked tab. Absence from the registry is `Detached`.
#[derive(Debug)]
pub enum TabEntry {
    /// Attach in flight. The filter may already be live, so comments that
    /// arrive now are kept in `captured` and become the session's buffer.
    Attaching {
        generation: Generation,
        subject_key: String,
        subject_epoch: u64,
        url: String,
        title: Option<String>,
        captured: DedupBuffer,
    },
    /// Attached and capturing
    Attached(TabSession),
    /// Being torn down. Reported as `Detached`, but no new attach starts
    /// until the old debugger is gone; `reattach` is started then.
    Detaching {
        phase: DetachPhase,
        reattach: Option<PendingAttach>,
    },
}

impl TabEntry {
    pub fn attachment_state(&self) -> AttachmentState {
        match self {
            Self::Attaching { .. } => AttachmentState::Attaching,
            Self::Attached(_) => AttachmentState::Attached,
            Self::Detaching { .. } => AttachmentState::Detached,
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            Self::Attaching { generation, .. } => *generation,
            Self::Attached(session) => session.generation,
            Self::Detaching { phase, .. } => phase.generation(),
        }
    }

    pub fn session(&self) -> Option<&TabSession> {
        match self {
            Self::Attached(session) => Some(session),
            _ => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut TabSession> {
        match self {
            Self::Attached(session) => Some(session),
            _ => None,
        }
    }
}

/// Complete state of one attached tab
#[derive(Debug)]
pub struct TabSession {
    /// Tab this session captures
    pub tab_id: TabId,
    /// Attach attempt that produced this session
    pub generation: Generation,
    /// Identity of the content currently shown
    pub subject_key: String,
    /// Bumped on every subject reset
    pub subject_epoch: u64,
    /// Last known URL
    pub url: String,
    /// Last known tab title
    pub title: Option<String>,
    /// Captured comments
    pub buffer: DedupBuffer,
    /// Pagination helper state
    pub scroll: ScrollState,
    /// When the debugger attached
    pub attached_at: DateTime<Utc>,
    /// When comments were last appended
    pub last_capture: Option<DateTime<Utc>>,
}

impl TabSession {
    /// Create a session with an empty buffer
    pub fn new(
        tab_id: TabId,
        generation: Generation,
        subject_key: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            tab_id,
            generation,
            subject_key: subject_key.into(),
            subject_epoch: 0,
            url: url.into(),
            title: None,
            buffer: DedupBuffer::new(),
            scroll: ScrollState::default(),
            attached_at: Utc::now(),
            last_capture: None,
        }
    }

    /// Switch to a new subject, discarding the old subject's comments
    pub fn reset_subject(&mut self, subject_key: impl Into<String>) {
        self.subject_key = subject_key.into();
        self.subject_epoch += 1;
        self.buffer.clear();
        self.last_capture = None;
    }

    /// Merge a batch of comments, returning how many were new
    pub fn merge(&mut self, comments: Vec<Comment>) -> usize {
        let appended = self.buffer.merge(comments);
        if appended > 0 {
            self.last_capture = Some(Utc::now());
        }
        appended
    }

    pub fn comment_count(&self) -> usize {
        self.buffer.len()
    }
}

/// Serializable session summary for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub tab_id: TabId,
    pub state: AttachmentState,
    pub subject_key: String,
    pub url: String,
    pub title: Option<String>,
    pub comment_count: usize,
    pub scroll: ScrollState,
    pub attached_at: Option<String>,
    pub last_capture: Option<String>,
}

impl SessionInfo {
    /// Summary of a live entry; tabs being torn down have none
    pub fn from_entry(tab_id: TabId, entry: &TabEntry) -> Option<Self> {
        match entry {
            TabEntry::Attaching {
                subject_key,
                url,
                title,
                captured,
                ..
            } => Some(Self {
                tab_id,
                state: AttachmentState::Attaching,
                subject_key: subject_key.clone(),
                url: url.clone(),
                title: title.clone(),
                comment_count: captured.len(),
                scroll: ScrollState::default(),
                attached_at: None,
                last_capture: None,
            }),
            TabEntry::Attached(session) => Some(Self::from(session)),
            TabEntry::Detaching { .. } => None,
        }
    }
}

impl From<&TabSession> for SessionInfo {
    fn from(session: &TabSession) -> Self {
        Self {
            tab_id: session.tab_id,
            state: AttachmentState::Attached,
            subject_key: session.subject_key.clone(),
            url: session.url.clone(),
            title: session.title.clone(),
            comment_count: session.comment_count(),
            scroll: session.scroll,
            attached_at: Some(session.attached_at.to_rfc3339()),
            last_capture: session.last_capture.map(|t| t.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = TabSession::new(TabId(3), Generation(1), "/@a/video/1", "https://x/@a/video/1");
        assert_eq!(session.comment_count(), 0);
        assert_eq!(session.subject_epoch, 0);
        assert!(!session.scroll.enabled);
    }

    #[test]
    fn test_reset_subject_clears_buffer() {
        let mut session = TabSession::new(TabId(3), Generation(1), "a", "u");
        session.merge(vec![Comment::new("1", "x"), Comment::new("2", "y")]);
        assert_eq!(session.comment_count(), 2);
        assert!(session.last_capture.is_some());

        session.reset_subject("b");
        assert_eq!(session.comment_count(), 0);
        assert_eq!(session.subject_epoch, 1);
        assert_eq!(session.subject_key, "b");
    }

    #[test]
    fn test_entry_state() {
        let attaching = TabEntry::Attaching {
            generation: Generation(4),
            subject_key: "k".into(),
            subject_epoch: 0,
            url: "u".into(),
            title: None,
            captured: DedupBuffer::new(),
        };
        assert_eq!(attaching.attachment_state(), AttachmentState::Attaching);
        assert!(attaching.session().is_none());

        let info = SessionInfo::from_entry(TabId(1), &attaching).unwrap();
        assert_eq!(info.comment_count, 0);
        assert_eq!(info.state, AttachmentState::Attaching);
    }

    #[test]
    fn test_detaching_entry_reads_as_detached() {
        let detaching = TabEntry::Detaching {
            phase: DetachPhase::AwaitingAttach(Generation(2)),
            reattach: None,
        };
        assert_eq!(detaching.attachment_state(), AttachmentState::Detached);
        assert_eq!(detaching.generation(), Generation(2));
        assert!(SessionInfo::from_entry(TabId(1), &detaching).is_none());
    }
}
