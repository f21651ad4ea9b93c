//! Session Registry
//!
//! Process-wide map of tracked tabs. Reads are open to everyone (UI
//! snapshots, the interception gateway, the scroll ticker); every mutation
//! goes through the `pub(super)` transition functions, which only the
//! lifecycle coordinator calls.

use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::buffer::DedupBuffer;
use super::events::CaptureEventEmitter;
use super::state::{
    AttachmentState, DetachPhase, Generation, PendingAttach, ScrollState, SessionInfo, TabEntry, TabSession,
};
use super::types::{Comment, TabId};

/// Title reported when no tab is active
pub const NO_ACTIVE_TAB_TITLE: &str = "No active tab found";

/// Comments of one tab as handed to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub tab_id: Option<TabId>,
    pub subject_title: String,
    pub comments: Vec<Comment>,
}

/// Where a captured batch must land to still be current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTarget {
    pub generation: Generation,
    pub subject_epoch: u64,
}

/// Shared tab -> session table
#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<DashMap<TabId, TabEntry>>,
    titles: Arc<DashMap<TabId, String>>,
    active_tab: Arc<RwLock<Option<TabId>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attachment_state(&self, tab_id: TabId) -> AttachmentState {
        self.entries
            .get(&tab_id)
            .map(|entry| entry.attachment_state())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, tab_id: TabId) -> bool {
        self.entries.contains_key(&tab_id)
    }

    pub fn active_tab(&self) -> Option<TabId> {
        *self.active_tab.read()
    }

    /// Current generation and subject epoch of a tab that is capturing or
    /// about to be
    pub fn capture_target(&self, tab_id: TabId) -> Option<CaptureTarget> {
        let entry = self.entries.get(&tab_id)?;
        match entry.value() {
            TabEntry::Attaching {
                generation,
                subject_epoch,
                ..
            } => Some(CaptureTarget {
                generation: *generation,
                subject_epoch: *subject_epoch,
            }),
            TabEntry::Attached(session) => Some(CaptureTarget {
                generation: session.generation,
                subject_epoch: session.subject_epoch,
            }),
            TabEntry::Detaching { .. } => None,
        }
    }

    pub fn comment_count(&self, tab_id: TabId) -> usize {
        self.entries
            .get(&tab_id)
            .and_then(|entry| entry.session().map(TabSession::comment_count))
            .unwrap_or(0)
    }

    pub fn scroll_state(&self, tab_id: TabId) -> Option<ScrollState> {
        self.entries
            .get(&tab_id)
            .and_then(|entry| entry.session().map(|session| session.scroll))
    }

    /// Snapshot of `tab_id`, or of the active tab when `None`.
    ///
    /// Untracked tabs yield an empty comment list rather than an error.
    pub fn snapshot(&self, tab_id: Option<TabId>) -> Snapshot {
        let Some(tab_id) = tab_id.or_else(|| self.active_tab()) else {
            return Snapshot {
                tab_id: None,
                subject_title: NO_ACTIVE_TAB_TITLE.to_string(),
                comments: Vec::new(),
            };
        };

        let known_title = self.titles.get(&tab_id).map(|t| t.clone());
        match self.entries.get(&tab_id) {
            Some(entry) => match entry.session() {
                Some(session) => Snapshot {
                    tab_id: Some(tab_id),
                    subject_title: session.title.clone().or(known_title).unwrap_or_default(),
                    comments: session.buffer.snapshot(),
                },
                None => Snapshot {
                    tab_id: Some(tab_id),
                    subject_title: known_title.unwrap_or_default(),
                    comments: Vec::new(),
                },
            },
            None => Snapshot {
                tab_id: Some(tab_id),
                subject_title: known_title.unwrap_or_default(),
                comments: Vec::new(),
            },
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .entries
            .iter()
            .filter_map(|entry| SessionInfo::from_entry(*entry.key(), entry.value()))
            .collect();
        sessions.sort_by_key(|info| info.tab_id);
        sessions
    }

    pub fn tracked_tabs(&self) -> Vec<TabId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ---- transitions (coordinator only) ----

    pub(super) fn set_active(&self, tab_id: Option<TabId>) {
        *self.active_tab.write() = tab_id;
    }

    pub(super) fn remember_title(&self, tab_id: TabId, title: &str) {
        self.titles.insert(tab_id, title.to_string());
        if let Some(mut entry) = self.entries.get_mut(&tab_id) {
            match entry.value_mut() {
                TabEntry::Attaching { title: t, .. } => *t = Some(title.to_string()),
                TabEntry::Attached(session) => session.title = Some(title.to_string()),
                TabEntry::Detaching { .. } => {}
            }
        }
    }

    pub(super) fn forget_tab(&self, tab_id: TabId) {
        self.titles.remove(&tab_id);
        let mut active = self.active_tab.write();
        if *active == Some(tab_id) {
            *active = None;
        }
    }

    /// Detached -> Attaching. Returns false when the tab already has an entry,
    /// including one still being torn down.
    pub(super) fn begin_attach(
        &self,
        tab_id: TabId,
        generation: Generation,
        subject_key: String,
        url: String,
    ) -> bool {
        if self.entries.contains_key(&tab_id) {
            return false;
        }
        let title = self.titles.get(&tab_id).map(|t| t.clone());
        self.entries.insert(
            tab_id,
            TabEntry::Attaching {
                generation,
                subject_key,
                subject_epoch: 0,
                url,
                title,
                captured: DedupBuffer::new(),
            },
        );
        true
    }

    /// Refresh the target of an in-flight attach
    pub(super) fn update_attaching(&self, tab_id: TabId, new_subject: String, new_url: String) {
        if let Some(mut entry) = self.entries.get_mut(&tab_id) {
            if let TabEntry::Attaching {
                subject_key,
                subject_epoch,
                url,
                captured,
                ..
            } = entry.value_mut()
            {
                if *subject_key != new_subject {
                    *subject_key = new_subject;
                    *subject_epoch += 1;
                    captured.clear();
                }
                *url = new_url;
            }
        }
    }

    /// Attaching -> Attached, only if the in-flight attempt is `generation`.
    /// Comments captured while attaching become the session's buffer.
    pub(super) fn complete_attach(&self, tab_id: TabId, generation: Generation, scroll: ScrollState) -> bool {
        let Some(mut entry) = self.entries.get_mut(&tab_id) else {
            return false;
        };
        let session = match entry.value_mut() {
            TabEntry::Attaching {
                generation: current,
                subject_key,
                subject_epoch,
                url,
                title,
                captured,
            } if *current == generation => {
                let mut session = TabSession::new(tab_id, generation, subject_key.clone(), url.clone());
                session.subject_epoch = *subject_epoch;
                session.title = title.clone();
                session.scroll = scroll;
                if !captured.is_empty() {
                    session.buffer = std::mem::take(captured);
                    session.last_capture = Some(chrono::Utc::now());
                }
                session
            }
            _ => return false,
        };
        *entry.value_mut() = TabEntry::Attached(session);
        true
    }

    /// Remove the in-flight attach `generation`; other entries are left alone
    pub(super) fn abandon_attach(&self, tab_id: TabId, generation: Generation) -> bool {
        self.entries
            .remove_if(&tab_id, |_, entry| {
                matches!(entry, TabEntry::Attaching { generation: g, .. } if *g == generation)
            })
            .is_some()
    }

    /// Attaching or Attached -> Detaching.
    ///
    /// Returns the state the tab was in and what has to settle before the
    /// entry can go. `None` when there is nothing to tear down; a tab already
    /// detaching only loses its queued re-attach.
    pub(super) fn begin_teardown(&self, tab_id: TabId) -> Option<(AttachmentState, DetachPhase)> {
        let mut entry = self.entries.get_mut(&tab_id)?;
        let (previous, phase) = match entry.value_mut() {
            TabEntry::Attaching { generation, .. } => {
                (AttachmentState::Attaching, DetachPhase::AwaitingAttach(*generation))
            }
            TabEntry::Attached(session) => (AttachmentState::Attached, DetachPhase::Detaching(session.generation)),
            TabEntry::Detaching { reattach, .. } => {
                *reattach = None;
                return None;
            }
        };
        *entry.value_mut() = TabEntry::Detaching { phase, reattach: None };
        Some((previous, phase))
    }

    /// Remember where a detaching tab should be attached once it is free.
    /// Returns false when the tab is not detaching.
    pub(super) fn queue_reattach(&self, tab_id: TabId, subject_key: String, url: String) -> bool {
        let Some(mut entry) = self.entries.get_mut(&tab_id) else {
            return false;
        };
        match entry.value_mut() {
            TabEntry::Detaching { reattach, .. } => {
                *reattach = Some(PendingAttach { subject_key, url });
                true
            }
            _ => false,
        }
    }

    /// The abandoned attach `generation` succeeded; its detach is now issued
    pub(super) fn detach_started(&self, tab_id: TabId, generation: Generation) -> bool {
        let Some(mut entry) = self.entries.get_mut(&tab_id) else {
            return false;
        };
        match entry.value_mut() {
            TabEntry::Detaching { phase, .. } if *phase == DetachPhase::AwaitingAttach(generation) => {
                *phase = DetachPhase::Detaching(generation);
                true
            }
            _ => false,
        }
    }

    /// Drop a detaching entry whose debugger from `generation` is gone.
    ///
    /// Returns `Some(reattach)` when the entry was removed.
    pub(super) fn finish_detach(&self, tab_id: TabId, generation: Generation) -> Option<Option<PendingAttach>> {
        self.entries
            .remove_if(&tab_id, |_, entry| {
                matches!(entry, TabEntry::Detaching { phase, .. } if phase.generation() == generation)
            })
            .map(|(_, entry)| match entry {
                TabEntry::Detaching { reattach, .. } => reattach,
                _ => None,
            })
    }

    /// Update URL of an attached tab and reset the buffer if the subject
    /// changed. Returns true on reset.
    pub(super) fn navigate(&self, tab_id: TabId, subject_key: &str, url: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(&tab_id) else {
            return false;
        };
        let Some(session) = entry.session_mut() else {
            return false;
        };
        session.url = url.to_string();
        if session.subject_key == subject_key {
            return false;
        }
        debug!(
            "Tab {} subject {} -> {}, dropping {} comments",
            tab_id,
            session.subject_key,
            subject_key,
            session.comment_count()
        );
        session.reset_subject(subject_key);
        true
    }

    /// Merge into the tab's buffer if it is still the attempt and subject
    /// the batch was captured for. Attached tabs notify while the entry is
    /// held; a tab still attaching keeps the comments for its session.
    ///
    /// Returns the number of comments appended, or `None` for a stale batch.
    pub(super) fn merge(
        &self,
        tab_id: TabId,
        target: CaptureTarget,
        comments: Vec<Comment>,
        emitter: &CaptureEventEmitter,
    ) -> Option<usize> {
        let mut entry = self.entries.get_mut(&tab_id)?;
        match entry.value_mut() {
            TabEntry::Attached(session) => {
                if session.generation != target.generation || session.subject_epoch != target.subject_epoch {
                    return None;
                }
                let appended = session.merge(comments);
                if appended > 0 {
                    emitter.emit_comments_updated(tab_id, session.comment_count());
                }
                Some(appended)
            }
            TabEntry::Attaching {
                generation,
                subject_epoch,
                captured,
                ..
            } => {
                if *generation != target.generation || *subject_epoch != target.subject_epoch {
                    return None;
                }
                Some(captured.merge(comments))
            }
            TabEntry::Detaching { .. } => None,
        }
    }

    pub(super) fn set_scroll(&self, tab_id: TabId, enabled: bool) -> Option<ScrollState> {
        let mut entry = self.entries.get_mut(&tab_id)?;
        let session = entry.session_mut()?;
        session.scroll.enabled = enabled;
        Some(session.scroll)
    }

    pub(super) fn clear(&self) -> Vec<TabId> {
        let tabs = self.tracked_tabs();
        self.entries.clear();
        tabs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::events::CaptureEvent;

    fn attached(registry: &SessionRegistry, tab: u64, generation: u64, subject: &str) {
        assert!(registry.begin_attach(TabId(tab), Generation(generation), subject.into(), "u".into()));
        assert!(registry.complete_attach(TabId(tab), Generation(generation), ScrollState::default()));
    }

    #[test]
    fn test_attach_transitions() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.attachment_state(TabId(1)), AttachmentState::Detached);

        assert!(registry.begin_attach(TabId(1), Generation(1), "a".into(), "u".into()));
        assert_eq!(registry.attachment_state(TabId(1)), AttachmentState::Attaching);
        assert!(!registry.begin_attach(TabId(1), Generation(2), "a".into(), "u".into()));

        assert!(!registry.complete_attach(TabId(1), Generation(9), ScrollState::default()));
        assert!(registry.complete_attach(TabId(1), Generation(1), ScrollState::default()));
        assert_eq!(registry.attachment_state(TabId(1)), AttachmentState::Attached);
    }

    #[test]
    fn test_abandon_only_matching_generation() {
        let registry = SessionRegistry::new();
        registry.begin_attach(TabId(1), Generation(3), "a".into(), "u".into());

        assert!(!registry.abandon_attach(TabId(1), Generation(2)));
        assert!(registry.is_tracked(TabId(1)));
        assert!(registry.abandon_attach(TabId(1), Generation(3)));
        assert!(!registry.is_tracked(TabId(1)));
    }

    #[test]
    fn test_merge_notifies_with_new_total() {
        let registry = SessionRegistry::new();
        let emitter = CaptureEventEmitter::new(8);
        let mut rx = emitter.subscribe();
        attached(&registry, 1, 1, "a");
        let target = registry.capture_target(TabId(1)).unwrap();

        let appended = registry.merge(TabId(1), target, vec![Comment::new("1", "x")], &emitter);
        assert_eq!(appended, Some(1));
        assert_eq!(
            rx.try_recv().unwrap(),
            CaptureEvent::CommentsUpdated { tab_id: TabId(1), count: 1 }
        );

        let appended = registry.merge(TabId(1), target, vec![Comment::new("1", "x")], &emitter);
        assert_eq!(appended, Some(0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_batches_rejected() {
        let registry = SessionRegistry::new();
        let emitter = CaptureEventEmitter::new(8);
        attached(&registry, 1, 1, "a");
        let before = registry.capture_target(TabId(1)).unwrap();

        assert!(registry.navigate(TabId(1), "b", "u2"));
        assert_eq!(registry.merge(TabId(1), before, vec![Comment::new("1", "x")], &emitter), None);
        assert_eq!(registry.comment_count(TabId(1)), 0);
        assert_eq!(registry.merge(TabId(2), before, vec![Comment::new("1", "x")], &emitter), None);
    }

    #[test]
    fn test_snapshot_fallbacks() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.snapshot(None).subject_title, NO_ACTIVE_TAB_TITLE);

        registry.remember_title(TabId(4), "Some page");
        registry.set_active(Some(TabId(4)));
        let snapshot = registry.snapshot(None);
        assert_eq!(snapshot.tab_id, Some(TabId(4)));
        assert_eq!(snapshot.subject_title, "Some page");
        assert!(snapshot.comments.is_empty());

        registry.forget_tab(TabId(4));
        assert_eq!(registry.active_tab(), None);
    }

    #[test]
    fn test_teardown_holds_tab_until_detached() {
        let registry = SessionRegistry::new();
        attached(&registry, 1, 1, "a");

        assert_eq!(
            registry.begin_teardown(TabId(1)),
            Some((AttachmentState::Attached, DetachPhase::Detaching(Generation(1))))
        );
        assert_eq!(registry.attachment_state(TabId(1)), AttachmentState::Detached);
        assert!(registry.list_sessions().is_empty());

        // still occupied: a new attach has to wait
        assert!(!registry.begin_attach(TabId(1), Generation(2), "b".into(), "u".into()));
        assert!(registry.queue_reattach(TabId(1), "b".into(), "u2".into()));
        assert_eq!(registry.begin_teardown(TabId(1)), None);
        assert!(registry.queue_reattach(TabId(1), "c".into(), "u3".into()));

        assert_eq!(registry.finish_detach(TabId(1), Generation(9)), None);
        assert_eq!(
            registry.finish_detach(TabId(1), Generation(1)),
            Some(Some(PendingAttach {
                subject_key: "c".into(),
                url: "u3".into(),
            }))
        );
        assert!(!registry.is_tracked(TabId(1)));
        assert!(!registry.queue_reattach(TabId(1), "c".into(), "u3".into()));
    }

    #[test]
    fn test_abandoned_attach_detaches_after_it_settles() {
        let registry = SessionRegistry::new();
        registry.begin_attach(TabId(1), Generation(5), "a".into(), "u".into());

        assert_eq!(
            registry.begin_teardown(TabId(1)),
            Some((AttachmentState::Attaching, DetachPhase::AwaitingAttach(Generation(5))))
        );
        assert!(!registry.complete_attach(TabId(1), Generation(5), ScrollState::default()));
        assert!(!registry.detach_started(TabId(1), Generation(4)));
        assert!(registry.detach_started(TabId(1), Generation(5)));
        assert!(!registry.detach_started(TabId(1), Generation(5)));
        assert_eq!(registry.finish_detach(TabId(1), Generation(5)), Some(None));
    }

    #[test]
    fn test_comments_kept_while_attaching() {
        let registry = SessionRegistry::new();
        let emitter = CaptureEventEmitter::new(8);
        let mut rx = emitter.subscribe();
        registry.begin_attach(TabId(1), Generation(1), "a".into(), "u".into());
        let target = registry.capture_target(TabId(1)).unwrap();

        let appended = registry.merge(TabId(1), target, vec![Comment::new("1", "x")], &emitter);
        assert_eq!(appended, Some(1));
        assert!(rx.try_recv().is_err());

        assert!(registry.complete_attach(TabId(1), Generation(1), ScrollState::default()));
        assert_eq!(registry.comment_count(TabId(1)), 1);
        assert_eq!(registry.capture_target(TabId(1)), Some(target));
    }

    #[test]
    fn test_subject_change_while_attaching_drops_early_comments() {
        let registry = SessionRegistry::new();
        let emitter = CaptureEventEmitter::new(8);
        registry.begin_attach(TabId(1), Generation(1), "a".into(), "u".into());
        let before = registry.capture_target(TabId(1)).unwrap();
        registry.merge(TabId(1), before, vec![Comment::new("1", "x")], &emitter);

        registry.update_attaching(TabId(1), "b".into(), "u2".into());
        assert_eq!(registry.merge(TabId(1), before, vec![Comment::new("2", "y")], &emitter), None);

        assert!(registry.complete_attach(TabId(1), Generation(1), ScrollState::default()));
        assert_eq!(registry.comment_count(TabId(1)), 0);
    }
}
