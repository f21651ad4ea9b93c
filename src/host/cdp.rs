//! Chrome DevTools Protocol host
//!
//! Drives a Chromium browser over its browser-level DevTools websocket.
//! Page targets are discovered with `Target.setDiscoverTargets` and given
//! local [`TabId`]s; attaching uses flattened sessions so every command and
//! event for a tab travels over the one socket tagged with its `sessionId`.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use super::{DebuggerHost, HostError, HostEvent, HostResult, InterceptedExchange, KeyEvent, KeyEventKind};
use crate::capture::types::{ChangeInfo, LifecycleEvent, ResponseBody, TabId, TabInfo, TabStatus};

/// Interception stage used for the comment API filter
const INTERCEPTION_STAGE: &str = "HeadersReceived";

/// `targetInfo` object from the Target domain
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}

impl TargetInfo {
    fn is_page(&self) -> bool {
        self.target_type == "page"
    }
}

/// What we know about a page target
#[derive(Debug, Clone)]
struct TargetRecord {
    target_id: String,
    url: String,
    title: String,
    session_id: Option<String>,
}

type PendingReply = oneshot::Sender<HostResult<Value>>;

struct CdpInner {
    outbound: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingReply>,
    tabs: DashMap<TabId, TargetRecord>,
    targets: DashMap<String, TabId>,
    sessions: DashMap<String, TabId>,
    next_tab: AtomicU64,
    discovered: AtomicBool,
    command_timeout_ms: u64,
    events: mpsc::UnboundedSender<HostEvent>,
}

/// CDP-backed [`DebuggerHost`]
#[derive(Clone)]
pub struct CdpHost {
    inner: Arc<CdpInner>,
}

impl CdpHost {
    /// Connect to a browser and start target discovery.
    ///
    /// `devtools_url` is either the browser websocket URL or the HTTP
    /// DevTools endpoint (`http://127.0.0.1:9222`), in which case the
    /// websocket URL is read from `/json/version`.
    pub async fn connect(
        devtools_url: &str,
        command_timeout_ms: u64,
    ) -> HostResult<(Self, mpsc::UnboundedReceiver<HostEvent>)> {
        let ws_url = resolve_websocket_url(devtools_url).await?;
        info!("Connecting to DevTools at {}", ws_url);

        let (socket, _response) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(CdpInner {
            outbound: outbound_tx,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            tabs: DashMap::new(),
            targets: DashMap::new(),
            sessions: DashMap::new(),
            next_tab: AtomicU64::new(1),
            discovered: AtomicBool::new(false),
            command_timeout_ms,
            events: event_tx,
        });

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    error!("DevTools socket write failed: {}", e);
                    break;
                }
            }
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.dispatch(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("DevTools socket error: {}", e);
                        break;
                    }
                }
            }
            reader.fail_pending();
            info!("DevTools connection closed");
            let _ = reader.events.send(HostEvent::Disconnected);
        });

        let host = Self { inner };
        host.inner
            .call("Target.setDiscoverTargets", json!({ "discover": true }), None)
            .await?;
        host.inner.discovered.store(true, Ordering::SeqCst);

        Ok((host, event_rx))
    }

    fn session_for(&self, tab_id: TabId) -> HostResult<String> {
        self.inner
            .tabs
            .get(&tab_id)
            .ok_or(HostError::UnknownTab(tab_id))?
            .session_id
            .clone()
            .ok_or(HostError::NotAttached(tab_id))
    }
}

impl CdpInner {
    async fn call(&self, method: &str, params: Value, session_id: Option<&str>) -> HostResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            request["sessionId"] = Value::String(session_id.to_string());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);

        if self.outbound.send(Message::Text(request.to_string().into())).is_err() {
            self.pending.remove(&id);
            return Err(HostError::Closed);
        }

        match tokio::time::timeout(Duration::from_millis(self.command_timeout_ms), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(HostError::Timeout(self.command_timeout_ms))
            }
        }
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(HostError::Closed));
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable DevTools message: {}", e);
                return;
            }
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            let Some((_, reply)) = self.pending.remove(&id) else {
                debug!("Reply for unknown command {}", id);
                return;
            };
            let result = match message.get("error") {
                Some(error) => Err(protocol_error(error)),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = reply.send(result);
            return;
        }

        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let session_id = message.get("sessionId").and_then(Value::as_str);

        match method {
            "Target.targetCreated" => self.on_target_created(&params),
            "Target.targetInfoChanged" => self.on_target_changed(&params),
            "Target.targetDestroyed" => self.on_target_destroyed(&params),
            "Target.detachedFromTarget" => self.on_detached(&params),
            "Network.requestIntercepted" => self.on_request_intercepted(session_id, &params),
            _ => {}
        }
    }

    /// Assign a tab id to a page target, or return the one it already has
    fn register_target(&self, info: &TargetInfo) -> (TabId, bool) {
        if let Some(tab_id) = self.targets.get(&info.target_id) {
            return (*tab_id, false);
        }
        let tab_id = TabId(self.next_tab.fetch_add(1, Ordering::SeqCst));
        self.targets.insert(info.target_id.clone(), tab_id);
        self.tabs.insert(
            tab_id,
            TargetRecord {
                target_id: info.target_id.clone(),
                url: info.url.clone(),
                title: info.title.clone(),
                session_id: None,
            },
        );
        (tab_id, true)
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(HostEvent::Lifecycle(event));
    }

    fn on_target_created(&self, params: &Value) {
        let Some(info) = target_info(params) else { return };
        if !info.is_page() {
            return;
        }

        let (tab_id, is_new) = self.register_target(&info);
        if !is_new {
            return;
        }
        debug!("Discovered tab {} ({})", tab_id, info.url);

        self.emit(LifecycleEvent::TabUpdated {
            tab_id,
            change: ChangeInfo {
                url: Some(info.url.clone()),
                status: None,
                title: Some(info.title.clone()),
            },
            tab: tab_info(tab_id, &info),
        });

        // Tabs opened after discovery started come up in the foreground
        if self.discovered.load(Ordering::SeqCst) {
            self.emit(LifecycleEvent::TabActivated { tab_id });
        }
    }

    fn on_target_changed(&self, params: &Value) {
        let Some(info) = target_info(params) else { return };
        if !info.is_page() {
            return;
        }

        let (tab_id, _) = self.register_target(&info);
        let change = match self.tabs.get_mut(&tab_id) {
            Some(mut record) => {
                let change = ChangeInfo {
                    url: (record.url != info.url).then(|| info.url.clone()),
                    status: None,
                    title: (record.title != info.title).then(|| info.title.clone()),
                };
                record.url = info.url.clone();
                record.title = info.title.clone();
                change
            }
            None => return,
        };

        if change.url.is_none() && change.title.is_none() {
            return;
        }

        self.emit(LifecycleEvent::TabUpdated {
            tab_id,
            change,
            tab: tab_info(tab_id, &info),
        });
    }

    fn on_target_destroyed(&self, params: &Value) {
        let Some(target_id) = params.get("targetId").and_then(Value::as_str) else { return };
        let Some((_, tab_id)) = self.targets.remove(target_id) else { return };

        if let Some((_, record)) = self.tabs.remove(&tab_id) {
            if let Some(session_id) = record.session_id {
                self.sessions.remove(&session_id);
            }
        }
        debug!("Tab {} closed", tab_id);
        self.emit(LifecycleEvent::TabRemoved { tab_id });
    }

    fn on_detached(&self, params: &Value) {
        let Some(session_id) = params.get("sessionId").and_then(Value::as_str) else { return };
        if let Some((_, tab_id)) = self.sessions.remove(session_id) {
            if let Some(mut record) = self.tabs.get_mut(&tab_id) {
                record.session_id = None;
            }
            info!("Debugger session for tab {} ended by the browser", tab_id);
        }
    }

    fn on_request_intercepted(&self, session_id: Option<&str>, params: &Value) {
        let Some(interception_id) = params.get("interceptionId").and_then(Value::as_str) else {
            return;
        };
        let request_url = params
            .pointer("/request/url")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let Some(tab_id) = session_id.and_then(|s| self.sessions.get(s).map(|t| *t)) else {
            // Without a tab we cannot hand it to the gateway; resume it here
            warn!("Interception {} from unknown session, resuming", interception_id);
            let params = json!({ "interceptionId": interception_id });
            let session_id = session_id.map(str::to_string);
            let _ = self.send_detached("Network.continueInterceptedRequest", params, session_id);
            return;
        };

        let _ = self.events.send(HostEvent::Intercepted(InterceptedExchange::new(
            tab_id,
            interception_id,
            request_url,
        )));
    }

    /// Fire a command without waiting for its reply
    fn send_detached(&self, method: &str, params: Value, session_id: Option<String>) -> HostResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            request["sessionId"] = Value::String(session_id);
        }
        self.outbound
            .send(Message::Text(request.to_string().into()))
            .map_err(|_| HostError::Closed)
    }
}

#[async_trait]
impl DebuggerHost for CdpHost {
    async fn attach(&self, tab_id: TabId) -> HostResult<()> {
        let target_id = {
            let record = self.inner.tabs.get(&tab_id).ok_or(HostError::UnknownTab(tab_id))?;
            if record.session_id.is_some() {
                return Ok(());
            }
            record.target_id.clone()
        };

        let result = self
            .inner
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await
            .map_err(|e| match e {
                HostError::Protocol { message, .. } if message.to_lowercase().contains("attached") => {
                    HostError::AlreadyAttached(message)
                }
                other => other,
            })?;

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| HostError::InvalidResponse("attachToTarget returned no sessionId".into()))?
            .to_string();

        let stored = match self.inner.tabs.get_mut(&tab_id) {
            Some(mut record) => {
                record.session_id = Some(session_id.clone());
                true
            }
            None => false,
        };
        if !stored {
            // Tab closed while attaching
            let _ = self
                .inner
                .call("Target.detachFromTarget", json!({ "sessionId": session_id }), None)
                .await;
            return Err(HostError::UnknownTab(tab_id));
        }
        self.inner.sessions.insert(session_id, tab_id);
        debug!("Attached to tab {}", tab_id);
        Ok(())
    }

    async fn detach(&self, tab_id: TabId) -> HostResult<()> {
        let session_id = match self.inner.tabs.get_mut(&tab_id) {
            Some(mut record) => record.session_id.take(),
            None => None,
        };
        let Some(session_id) = session_id else {
            debug!("Nothing to detach for tab {}", tab_id);
            return Ok(());
        };
        self.inner.sessions.remove(&session_id);

        match self
            .inner
            .call("Target.detachFromTarget", json!({ "sessionId": session_id }), None)
            .await
        {
            Ok(_) => Ok(()),
            // Session already gone on the browser side
            Err(HostError::Protocol { message, .. }) => {
                debug!("Detach for tab {} ignored: {}", tab_id, message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn enable_network(&self, tab_id: TabId) -> HostResult<()> {
        let session_id = self.session_for(tab_id)?;
        self.inner.call("Network.enable", json!({}), Some(&session_id)).await?;
        Ok(())
    }

    async fn set_interception_filter(&self, tab_id: TabId, url_pattern: &str) -> HostResult<()> {
        let session_id = self.session_for(tab_id)?;
        self.inner
            .call(
                "Network.setRequestInterception",
                json!({
                    "patterns": [{
                        "urlPattern": url_pattern,
                        "interceptionStage": INTERCEPTION_STAGE,
                    }]
                }),
                Some(&session_id),
            )
            .await?;
        Ok(())
    }

    async fn get_response_body(&self, tab_id: TabId, interception_id: &str) -> HostResult<ResponseBody> {
        let session_id = self.session_for(tab_id)?;
        let result = self
            .inner
            .call(
                "Network.getResponseBodyForInterception",
                json!({ "interceptionId": interception_id }),
                Some(&session_id),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn continue_exchange(&self, tab_id: TabId, interception_id: &str) -> HostResult<()> {
        let session_id = self.session_for(tab_id)?;
        self.inner
            .call(
                "Network.continueInterceptedRequest",
                json!({ "interceptionId": interception_id }),
                Some(&session_id),
            )
            .await?;
        Ok(())
    }

    async fn list_tabs(&self) -> HostResult<Vec<TabInfo>> {
        let result = self.inner.call("Target.getTargets", json!({}), None).await?;
        let infos: Vec<TargetInfo> = serde_json::from_value(
            result.get("targetInfos").cloned().unwrap_or_else(|| Value::Array(Vec::new())),
        )?;

        Ok(infos
            .iter()
            .filter(|info| info.is_page())
            .map(|info| {
                let (tab_id, _) = self.inner.register_target(info);
                tab_info(tab_id, info)
            })
            .collect())
    }

    async fn dispatch_key(&self, tab_id: TabId, event: KeyEvent) -> HostResult<()> {
        let session_id = self.session_for(tab_id)?;
        let kind = match event.kind {
            KeyEventKind::KeyDown => "keyDown",
            KeyEventKind::KeyUp => "keyUp",
        };
        self.inner
            .call(
                "Input.dispatchKeyEvent",
                json!({
                    "type": kind,
                    "key": event.key,
                    "code": event.code,
                    "windowsVirtualKeyCode": event.windows_virtual_key_code,
                }),
                Some(&session_id),
            )
            .await?;
        Ok(())
    }

    fn host_type(&self) -> &'static str {
        "cdp"
    }
}

/// Find the browser websocket URL for a DevTools endpoint
async fn resolve_websocket_url(devtools_url: &str) -> HostResult<String> {
    if devtools_url.starts_with("ws://") || devtools_url.starts_with("wss://") {
        return Ok(devtools_url.to_string());
    }

    let version_url = format!("{}/json/version", devtools_url.trim_end_matches('/'));
    let version: Value = reqwest::get(&version_url).await?.error_for_status()?.json().await?;
    version
        .get("webSocketDebuggerUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HostError::InvalidResponse(format!("no webSocketDebuggerUrl at {}", version_url)))
}

fn protocol_error(error: &Value) -> HostError {
    HostError::Protocol {
        code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    }
}

fn target_info(params: &Value) -> Option<TargetInfo> {
    params
        .get("targetInfo")
        .cloned()
        .and_then(|info| serde_json::from_value(info).ok())
}

fn tab_info(tab_id: TabId, info: &TargetInfo) -> TabInfo {
    TabInfo {
        id: Some(tab_id),
        url: Some(info.url.clone()),
        title: Some(info.title.clone()),
        status: Some(TabStatus::Complete),
    }
}
