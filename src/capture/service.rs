//! Capture Service
//!
//! Wires the coordinator, gateway and registry together and hands out a
//! cloneable [`CaptureHandle`] for the UI and automation side.

use log::info;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::coordinator::{CoordinatorMsg, LifecycleCoordinator};
use super::error::{CaptureError, CaptureResult};
use super::events::{CaptureEvent, CaptureEventEmitter};
use super::registry::{SessionRegistry, Snapshot};
use super::site::SiteMatcher;
use super::state::{AttachmentState, ScrollState, SessionInfo};
use super::types::{LifecycleEvent, TabId};
use crate::host::{DebuggerHost, HostEvent};

/// Capture settings independent of the host
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub site: SiteMatcher,
    pub event_capacity: usize,
    pub scroll_by_default: bool,
}

pub struct CaptureService;

impl CaptureService {
    /// Spawn the coordinator for `host` and return a handle to it
    pub fn start(
        host: Arc<dyn DebuggerHost>,
        host_events: mpsc::UnboundedReceiver<HostEvent>,
        options: CaptureOptions,
    ) -> CaptureHandle {
        let registry = SessionRegistry::new();
        let emitter = CaptureEventEmitter::new(options.event_capacity);
        let (tx, rx) = mpsc::unbounded_channel();
        let (running_tx, running_rx) = watch::channel(true);

        info!(
            "Starting capture on {} host for {}",
            host.host_type(),
            options.site.api_pattern()
        );

        let coordinator = LifecycleCoordinator::new(
            host,
            registry.clone(),
            Arc::new(options.site),
            emitter.clone(),
            tx.clone(),
            ScrollState {
                enabled: options.scroll_by_default,
            },
        );
        tokio::spawn(coordinator.run(rx, host_events, running_tx));

        CaptureHandle {
            tx,
            registry,
            emitter,
            running: running_rx,
        }
    }
}

/// Cloneable access to a running capture service
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::UnboundedSender<CoordinatorMsg>,
    registry: SessionRegistry,
    emitter: CaptureEventEmitter,
    running: watch::Receiver<bool>,
}

impl CaptureHandle {
    /// Read-only view of the registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Comments of `tab_id`, or of the active tab
    pub fn snapshot(&self, tab_id: Option<TabId>) -> Snapshot {
        self.registry.snapshot(tab_id)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list_sessions()
    }

    pub fn attachment_state(&self, tab_id: TabId) -> AttachmentState {
        self.registry.attachment_state(tab_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.emitter.subscribe()
    }

    /// Scroll state of `tab_id`, or of the active tab
    pub fn scroll_state(&self, tab_id: Option<TabId>) -> Option<ScrollState> {
        let tab_id = tab_id.or_else(|| self.registry.active_tab())?;
        self.registry.scroll_state(tab_id)
    }

    pub async fn set_scroll(&self, tab_id: Option<TabId>, enabled: bool) -> CaptureResult<ScrollState> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(CoordinatorMsg::SetScroll { tab_id, enabled, reply })
            .map_err(|_| CaptureError::CoordinatorStopped)?;
        response.await.map_err(|_| CaptureError::CoordinatorStopped)?
    }

    /// Mark a tab as the one the user is looking at
    pub fn activate(&self, tab_id: TabId) -> CaptureResult<()> {
        self.send_lifecycle(LifecycleEvent::TabActivated { tab_id })
    }

    /// Inject a lifecycle event as if the host had sent it
    pub fn send_lifecycle(&self, event: LifecycleEvent) -> CaptureResult<()> {
        self.tx
            .send(CoordinatorMsg::Host(HostEvent::Lifecycle(event)))
            .map_err(|_| CaptureError::CoordinatorStopped)
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Resolves once the coordinator has stopped
    pub async fn stopped(&self) {
        let mut running = self.running.clone();
        let _ = running.wait_for(|running| !*running).await;
    }

    /// Detach from every tab and stop the coordinator
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(CoordinatorMsg::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }
}
