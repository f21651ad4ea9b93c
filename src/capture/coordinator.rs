//! Lifecycle Coordinator
//!
//! The one task that mutates the session registry. Tab lifecycle events,
//! attach completions and captured batches all arrive as messages and are
//! handled in order. Host calls run on spawned tasks and report back here,
//! where their result is checked against the registry as it is *now*: a tab
//! may have been closed or navigated while the call was in flight.
//!
//! A tab holds at most one debugger at a time. Teardown leaves a `Detaching`
//! entry until the host confirms the detach (or the abandoned attach has
//! settled), and a navigation back to the site in the meantime is queued
//! rather than raced.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::error::{CaptureError, CaptureResult};
use super::events::{CaptureEvent, CaptureEventEmitter};
use super::gateway::{CapturedBatch, InterceptionGateway};
use super::registry::SessionRegistry;
use super::site::SiteMatcher;
use super::state::{AttachmentState, DetachPhase, Generation, PendingAttach, ScrollState};
use super::types::{ChangeInfo, LifecycleEvent, TabId, TabInfo};
use crate::host::{DebuggerHost, HostEvent};

/// Messages processed by the coordinator loop
#[derive(Debug)]
pub enum CoordinatorMsg {
    /// Event forwarded from the host
    Host(HostEvent),
    /// A spawned attach finished
    AttachCompleted {
        tab_id: TabId,
        generation: Generation,
        result: CaptureResult<()>,
    },
    /// A spawned detach finished, successfully or not
    DetachCompleted { tab_id: TabId, generation: Generation },
    /// Comments decoded by the gateway
    Captured(CapturedBatch),
    /// Turn the pagination helper on or off for a tab (active tab if `None`)
    SetScroll {
        tab_id: Option<TabId>,
        enabled: bool,
        reply: oneshot::Sender<CaptureResult<ScrollState>>,
    },
    /// Detach everything, wait for the host to confirm, then stop
    Shutdown { reply: oneshot::Sender<()> },
}

pub struct LifecycleCoordinator {
    host: Arc<dyn DebuggerHost>,
    registry: SessionRegistry,
    site: Arc<SiteMatcher>,
    gateway: InterceptionGateway,
    emitter: CaptureEventEmitter,
    tx: mpsc::UnboundedSender<CoordinatorMsg>,
    next_generation: u64,
    scroll_default: ScrollState,
    /// Set once shutdown starts; replied to when the registry is empty
    stopping: Option<Vec<oneshot::Sender<()>>>,
}

impl LifecycleCoordinator {
    pub fn new(
        host: Arc<dyn DebuggerHost>,
        registry: SessionRegistry,
        site: Arc<SiteMatcher>,
        emitter: CaptureEventEmitter,
        tx: mpsc::UnboundedSender<CoordinatorMsg>,
        scroll_default: ScrollState,
    ) -> Self {
        let gateway = InterceptionGateway::new(host.clone(), registry.clone(), site.clone(), tx.clone());
        Self {
            host,
            registry,
            site,
            gateway,
            emitter,
            tx,
            next_generation: 0,
            scroll_default,
            stopping: None,
        }
    }

    /// Run until shutdown completes or the host disconnects
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CoordinatorMsg>,
        mut host_events: mpsc::UnboundedReceiver<HostEvent>,
        running: watch::Sender<bool>,
    ) {
        self.scan_open_tabs().await;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                event = host_events.recv() => match event {
                    Some(HostEvent::Disconnected) | None => {
                        self.on_disconnected();
                        break;
                    }
                    Some(event) => self.handle_host_event(event),
                },
            }

            if self.stopping.is_some() && self.registry.is_empty() {
                info!("All tabs detached");
                break;
            }
        }

        for reply in self.stopping.take().unwrap_or_default() {
            let _ = reply.send(());
        }
        let _ = running.send(false);
        debug!("Capture coordinator stopped");
    }

    /// Treat every tab that is already open as freshly updated
    async fn scan_open_tabs(&mut self) {
        match self.host.list_tabs().await {
            Ok(tabs) => {
                for tab in tabs {
                    let (Some(tab_id), Some(url)) = (tab.id, tab.url.clone()) else {
                        continue;
                    };
                    self.on_lifecycle(LifecycleEvent::TabUpdated {
                        tab_id,
                        change: ChangeInfo {
                            url: Some(url),
                            ..Default::default()
                        },
                        tab,
                    });
                }
            }
            Err(e) => warn!("Could not list open tabs: {}", e),
        }
    }

    fn handle(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::Host(event) => self.handle_host_event(event),
            CoordinatorMsg::AttachCompleted {
                tab_id,
                generation,
                result,
            } => self.on_attach_completed(tab_id, generation, result),
            CoordinatorMsg::DetachCompleted { tab_id, generation } => self.on_detach_completed(tab_id, generation),
            CoordinatorMsg::Captured(batch) => self.on_captured(batch),
            CoordinatorMsg::SetScroll { tab_id, enabled, reply } => {
                let _ = reply.send(self.set_scroll(tab_id, enabled));
            }
            CoordinatorMsg::Shutdown { reply } => self.begin_shutdown(reply),
        }
    }

    fn handle_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Lifecycle(event) => self.on_lifecycle(event),
            HostEvent::Intercepted(exchange) => self.gateway.dispatch(exchange),
            HostEvent::Disconnected => self.on_disconnected(),
        }
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent) {
        if self.stopping.is_some() {
            debug!("Shutting down, ignoring {:?}", event);
            return;
        }
        match event {
            LifecycleEvent::TabUpdated { tab_id, change, tab } => {
                let TabInfo { url, title, .. } = tab;
                if let Some(title) = change.title.as_deref().or(title.as_deref()) {
                    self.registry.remember_title(tab_id, title);
                }
                if let Some(url) = url.or(change.url) {
                    self.on_navigated(tab_id, &url);
                }
            }
            LifecycleEvent::TabActivated { tab_id } => {
                self.registry.set_active(Some(tab_id));
                self.emitter.emit(CaptureEvent::ActiveTabChanged { tab_id });
            }
            LifecycleEvent::TabRemoved { tab_id } => {
                self.teardown(tab_id, "tab closed");
                self.registry.forget_tab(tab_id);
            }
            LifecycleEvent::SubjectChanged { tab_id, url } => self.on_navigated(tab_id, &url),
        }
    }

    fn on_navigated(&mut self, tab_id: TabId, url: &str) {
        if !self.site.is_tracked(url) {
            self.teardown(tab_id, "left tracked site");
            return;
        }

        let subject_key = self.site.subject_key(url);
        match self.registry.attachment_state(tab_id) {
            AttachmentState::Detached => {
                if self.registry.queue_reattach(tab_id, subject_key.clone(), url.to_string()) {
                    debug!("Tab {} back on site, attaching once the old debugger is gone", tab_id);
                } else {
                    self.begin_attach(tab_id, subject_key, url.to_string());
                }
            }
            AttachmentState::Attaching => {
                debug!("Attach already in flight for tab {}", tab_id);
                self.registry.update_attaching(tab_id, subject_key, url.to_string());
            }
            AttachmentState::Attached => {
                if self.registry.navigate(tab_id, &subject_key, url) {
                    info!("Tab {} moved to {}, buffer reset", tab_id, subject_key);
                    self.emitter.emit(CaptureEvent::SubjectReset { tab_id, subject_key });
                }
            }
        }
    }

    fn begin_attach(&mut self, tab_id: TabId, subject_key: String, url: String) {
        self.next_generation += 1;
        let generation = Generation(self.next_generation);
        if !self.registry.begin_attach(tab_id, generation, subject_key, url) {
            return;
        }
        self.emitter
            .emit_state_changed(tab_id, AttachmentState::Detached, AttachmentState::Attaching);
        debug!("Attaching to tab {} (attempt {})", tab_id, generation.0);

        let host = self.host.clone();
        let tx = self.tx.clone();
        let pattern = self.site.api_pattern().to_string();
        tokio::spawn(async move {
            let result = attach_and_intercept(host.as_ref(), tab_id, &pattern).await;
            let _ = tx.send(CoordinatorMsg::AttachCompleted {
                tab_id,
                generation,
                result,
            });
        });
    }

    fn on_attach_completed(&mut self, tab_id: TabId, generation: Generation, result: CaptureResult<()>) {
        match result {
            Ok(()) => {
                if self.registry.complete_attach(tab_id, generation, self.scroll_default) {
                    info!("Capturing comments on tab {}", tab_id);
                    self.emitter
                        .emit_state_changed(tab_id, AttachmentState::Attaching, AttachmentState::Attached);
                    let early = self.registry.comment_count(tab_id);
                    if early > 0 {
                        self.emitter.emit_comments_updated(tab_id, early);
                    }
                } else if self.registry.detach_started(tab_id, generation) {
                    debug!("Attach {} on tab {} no longer wanted, detaching", generation.0, tab_id);
                    self.spawn_detach(tab_id, generation);
                } else {
                    debug!("{}, ignoring attach {}", CaptureError::StaleSession(tab_id), generation.0);
                }
            }
            Err(e) => {
                if self.registry.abandon_attach(tab_id, generation) {
                    self.emitter
                        .emit_state_changed(tab_id, AttachmentState::Attaching, AttachmentState::Detached);
                    match &e {
                        CaptureError::AttachConflict(_) => info!("{}; not capturing", e),
                        _ => warn!("{}", e),
                    }
                } else if let Some(reattach) = self.registry.finish_detach(tab_id, generation) {
                    // Nothing attached, so nothing to detach
                    debug!("Abandoned attach on tab {} failed: {}", tab_id, e);
                    self.resume_attach(tab_id, reattach);
                } else {
                    debug!("Ignoring stale attach failure for tab {}: {}", tab_id, e);
                }
            }
        }
    }

    fn on_detach_completed(&mut self, tab_id: TabId, generation: Generation) {
        match self.registry.finish_detach(tab_id, generation) {
            Some(reattach) => {
                debug!("Tab {} released", tab_id);
                self.resume_attach(tab_id, reattach);
            }
            None => debug!("{}, ignoring detach {}", CaptureError::StaleSession(tab_id), generation.0),
        }
    }

    /// Start the attach that was queued while the tab was being torn down
    fn resume_attach(&mut self, tab_id: TabId, reattach: Option<PendingAttach>) {
        if self.stopping.is_some() {
            return;
        }
        if let Some(PendingAttach { subject_key, url }) = reattach {
            self.begin_attach(tab_id, subject_key, url);
        }
    }

    fn on_captured(&mut self, batch: CapturedBatch) {
        let CapturedBatch {
            tab_id,
            target,
            comments,
        } = batch;
        let incoming = comments.len();

        match self.registry.merge(tab_id, target, comments, &self.emitter) {
            Some(appended) => debug!(
                "Tab {}: {} of {} comments new, {} total",
                tab_id,
                appended,
                incoming,
                self.registry.comment_count(tab_id)
            ),
            None => debug!("{}, dropping {} comments", CaptureError::StaleSession(tab_id), incoming),
        }
    }

    fn set_scroll(&mut self, tab_id: Option<TabId>, enabled: bool) -> CaptureResult<ScrollState> {
        let tab_id = tab_id
            .or_else(|| self.registry.active_tab())
            .ok_or(CaptureError::NoActiveTab)?;
        self.registry
            .set_scroll(tab_id, enabled)
            .ok_or(CaptureError::StaleSession(tab_id))
    }

    /// Stop capturing a tab. The entry stays, as `Detaching`, until the
    /// debugger is confirmed gone.
    fn teardown(&mut self, tab_id: TabId, reason: &str) {
        let Some((previous, phase)) = self.registry.begin_teardown(tab_id) else {
            return;
        };
        self.emitter
            .emit_state_changed(tab_id, previous, AttachmentState::Detached);

        match phase {
            DetachPhase::AwaitingAttach(generation) => {
                debug!(
                    "Abandoned attach {} for tab {} ({}), detaching once it settles",
                    generation.0, tab_id, reason
                );
            }
            DetachPhase::Detaching(generation) => {
                self.spawn_detach(tab_id, generation);
                info!("Stopped capturing tab {} ({})", tab_id, reason);
            }
        }
    }

    fn spawn_detach(&self, tab_id: TabId, generation: Generation) {
        let host = self.host.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = host.detach(tab_id).await {
                warn!("{}", CaptureError::from_host(tab_id, "detach", e));
            }
            let _ = tx.send(CoordinatorMsg::DetachCompleted { tab_id, generation });
        });
    }

    fn on_disconnected(&mut self) {
        let dropped = self.registry.clear();
        warn!("Host disconnected, dropped {} tracked tabs", dropped.len());
    }

    /// Tear down every tab; the loop exits once all of them are released.
    /// Attaches still in flight are waited for and then detached.
    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if let Some(replies) = self.stopping.as_mut() {
            replies.push(reply);
            return;
        }
        self.stopping = Some(vec![reply]);

        let tabs = self.registry.tracked_tabs();
        info!("Detaching from {} tabs", tabs.len());
        for tab_id in tabs {
            self.teardown(tab_id, "shutting down");
        }
    }
}

/// Attach, enable network events and install the interception filter.
///
/// If setup fails after the attach succeeded the tab is detached again so
/// no debugger is left behind.
async fn attach_and_intercept(host: &dyn DebuggerHost, tab_id: TabId, pattern: &str) -> CaptureResult<()> {
    host.attach(tab_id)
        .await
        .map_err(|e| CaptureError::from_host(tab_id, "attach", e))?;

    let setup = async {
        host.enable_network(tab_id)
            .await
            .map_err(|e| CaptureError::from_host(tab_id, "enable_network", e))?;
        host.set_interception_filter(tab_id, pattern)
            .await
            .map_err(|e| CaptureError::from_host(tab_id, "set_interception_filter", e))
    }
    .await;

    if let Err(e) = setup {
        if let Err(detach_err) = host.detach(tab_id).await {
            warn!("{}", CaptureError::from_host(tab_id, "detach", detach_err));
        }
        return Err(e);
    }
    Ok(())
}
