//! Recording host for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

use super::{DebuggerHost, HostError, HostResult, KeyEvent};
use crate::capture::types::{ResponseBody, TabId, TabInfo};

/// A host operation as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Attach(TabId),
    Detach(TabId),
    EnableNetwork(TabId),
    SetFilter(TabId, String),
    GetBody(TabId, String),
    Continue(TabId, String),
    Key(TabId, KeyEvent),
}

#[derive(Default)]
struct MockState {
    calls: Vec<HostCall>,
    conflicts: HashSet<TabId>,
    failing_filters: HashSet<TabId>,
    bodies: HashMap<String, ResponseBody>,
    tabs: Vec<TabInfo>,
}

/// Host that records every call and answers from canned data
#[derive(Default)]
pub struct MockHost {
    state: Mutex<MockState>,
    attach_gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make attach fail as if another debugger owned the tab
    pub fn conflict_on(&self, tab_id: TabId) {
        self.state.lock().conflicts.insert(tab_id);
    }

    /// Make interception setup fail after a successful attach
    pub fn fail_filter_on(&self, tab_id: TabId) {
        self.state.lock().failing_filters.insert(tab_id);
    }

    pub fn set_body(&self, interception_id: &str, body: ResponseBody) {
        self.state.lock().bodies.insert(interception_id.to_string(), body);
    }

    pub fn set_tabs(&self, tabs: Vec<TabInfo>) {
        self.state.lock().tabs = tabs;
    }

    /// Hold every attach until `true` is sent on the returned gate
    pub fn hold_attaches(&self) -> watch::Sender<bool> {
        let (gate, open) = watch::channel(false);
        *self.attach_gate.lock() = Some(open);
        gate
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &HostCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn count_where(&self, pred: impl Fn(&HostCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: HostCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl DebuggerHost for MockHost {
    async fn attach(&self, tab_id: TabId) -> HostResult<()> {
        self.record(HostCall::Attach(tab_id));
        let gate = self.attach_gate.lock().clone();
        if let Some(mut open) = gate {
            let _ = open.wait_for(|is_open| *is_open).await;
        }
        if self.state.lock().conflicts.contains(&tab_id) {
            return Err(HostError::AlreadyAttached(format!("tab {}", tab_id)));
        }
        Ok(())
    }

    async fn detach(&self, tab_id: TabId) -> HostResult<()> {
        self.record(HostCall::Detach(tab_id));
        Ok(())
    }

    async fn enable_network(&self, tab_id: TabId) -> HostResult<()> {
        self.record(HostCall::EnableNetwork(tab_id));
        Ok(())
    }

    async fn set_interception_filter(&self, tab_id: TabId, url_pattern: &str) -> HostResult<()> {
        self.record(HostCall::SetFilter(tab_id, url_pattern.to_string()));
        if self.state.lock().failing_filters.contains(&tab_id) {
            return Err(HostError::Protocol {
                code: -32000,
                message: "interception unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn get_response_body(&self, tab_id: TabId, interception_id: &str) -> HostResult<ResponseBody> {
        self.record(HostCall::GetBody(tab_id, interception_id.to_string()));
        self.state
            .lock()
            .bodies
            .get(interception_id)
            .cloned()
            .ok_or_else(|| HostError::Protocol {
                code: -32000,
                message: format!("no body for {}", interception_id),
            })
    }

    async fn continue_exchange(&self, tab_id: TabId, interception_id: &str) -> HostResult<()> {
        self.record(HostCall::Continue(tab_id, interception_id.to_string()));
        Ok(())
    }

    async fn list_tabs(&self) -> HostResult<Vec<TabInfo>> {
        Ok(self.state.lock().tabs.clone())
    }

    async fn dispatch_key(&self, tab_id: TabId, event: KeyEvent) -> HostResult<()> {
        self.record(HostCall::Key(tab_id, event));
        Ok(())
    }

    fn host_type(&self) -> &'static str {
        "mock"
    }
}
