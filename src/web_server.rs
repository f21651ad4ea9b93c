//! HTTP + WebSocket surface for the popup UI
//!
//! Read endpoints answer from the registry directly; scroll changes go
//! through the coordinator. `/ws` pushes every capture event as JSON.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::net::TcpListener;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use crate::capture::{CaptureError, CaptureHandle, Comment, TabId};

/// `?tab=ID`; the active tab when absent
#[derive(Debug, Default, Deserialize)]
pub struct TabQuery {
    pub tab: Option<u64>,
}

impl TabQuery {
    fn tab_id(&self) -> Option<TabId> {
        self.tab.map(TabId)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
    pub tab: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollRequest {
    pub tab_id: Option<TabId>,
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScrollResponse {
    pub tab_id: Option<TabId>,
    pub enabled: bool,
}

/// Error body returned by every endpoint
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<CaptureError> for ApiError {
    fn from(err: CaptureError) -> Self {
        let status = match err {
            CaptureError::NoActiveTab | CaptureError::StaleSession(_) => StatusCode::NOT_FOUND,
            CaptureError::CoordinatorStopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Render comments for the clipboard: a pretty JSON array, or one text per line
pub fn export_comments(comments: &[Comment], format: ExportFormat) -> serde_json::Result<String> {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(comments),
        ExportFormat::Text => Ok(comments
            .iter()
            .map(|comment| comment.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

pub fn router(handle: CaptureHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/sessions", get(get_sessions))
        .route("/api/scroll", get(get_scroll).post(set_scroll))
        .route("/api/export", get(export))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(handle)
}

/// Serve on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    handle: CaptureHandle,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("UI available at http://{}", addr);
    }
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn get_snapshot(State(handle): State<CaptureHandle>, Query(query): Query<TabQuery>) -> impl IntoResponse {
    Json(handle.snapshot(query.tab_id()))
}

async fn get_sessions(State(handle): State<CaptureHandle>) -> impl IntoResponse {
    Json(handle.sessions())
}

async fn get_scroll(State(handle): State<CaptureHandle>, Query(query): Query<TabQuery>) -> impl IntoResponse {
    let tab_id = query.tab_id().or_else(|| handle.registry().active_tab());
    let enabled = handle
        .scroll_state(tab_id)
        .map(|scroll| scroll.enabled)
        .unwrap_or(false);
    Json(ScrollResponse { tab_id, enabled })
}

async fn set_scroll(
    State(handle): State<CaptureHandle>,
    Json(request): Json<ScrollRequest>,
) -> Result<Json<ScrollResponse>, ApiError> {
    let tab_id = request.tab_id.or_else(|| handle.registry().active_tab());
    let scroll = handle.set_scroll(request.tab_id, request.enabled).await?;
    info!(
        "Scrolling {} for tab {}",
        if scroll.enabled { "enabled" } else { "disabled" },
        tab_id.map(|t| t.to_string()).unwrap_or_default()
    );
    Ok(Json(ScrollResponse {
        tab_id,
        enabled: scroll.enabled,
    }))
}

async fn export(State(handle): State<CaptureHandle>, Query(query): Query<ExportQuery>) -> Result<Response, ApiError> {
    let snapshot = handle.snapshot(query.tab.map(TabId));
    let body = export_comments(&snapshot.comments, query.format).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: e.to_string(),
    })?;
    let content_type = match query.format {
        ExportFormat::Json => "application/json",
        ExportFormat::Text => "text/plain; charset=utf-8",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn ws_handler(ws: WebSocketUpgrade, State(handle): State<CaptureHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_events(socket, handle))
}

/// Forward capture events to one client until either side goes away
async fn push_events(socket: WebSocket, handle: CaptureHandle) {
    debug!("Event socket connected");
    let mut events = BroadcastStream::new(handle.subscribe());
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize {}: {}", event.event_name(), e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!("Event socket lagged, skipped {} events", skipped);
                }
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Event socket error: {}", e);
                    break;
                }
            },
        }
    }

    debug!("Event socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::{ChangeInfo, LifecycleEvent, TabInfo};
    use crate::capture::{AttachmentState, CaptureOptions, CaptureService, SiteMatcher};
    use crate::host::mock::MockHost;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn start_test_server() -> (SocketAddr, CaptureHandle, mpsc::UnboundedSender<crate::host::HostEvent>) {
        let host = MockHost::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = CaptureService::start(
            host,
            events_rx,
            CaptureOptions {
                site: SiteMatcher::new("tiktok.com", "*://*.tiktok.com/api/comment/list*", None).unwrap(),
                event_capacity: 16,
                scroll_by_default: false,
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(handle.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle, events_tx)
    }

    #[test]
    fn test_export_formats() {
        let comments = vec![Comment::new("1", "first"), Comment::new("2", "second")];

        assert_eq!(export_comments(&comments, ExportFormat::Text).unwrap(), "first\nsecond");

        let json = export_comments(&comments, ExportFormat::Json).unwrap();
        let parsed: Vec<Comment> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, comments);
        assert!(json.contains('\n'));

        assert_eq!(export_comments(&[], ExportFormat::Text).unwrap(), "");
    }

    #[test]
    fn test_capture_errors_map_to_status() {
        assert_eq!(ApiError::from(CaptureError::NoActiveTab).status, StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(CaptureError::CoordinatorStopped).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_snapshot_without_active_tab() {
        let (addr, _handle, _events) = start_test_server().await;

        let body: serde_json::Value = reqwest::get(format!("http://{}/api/snapshot", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["subjectTitle"], "No active tab found");
        assert_eq!(body["comments"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_scroll_endpoints() {
        let (addr, handle, events) = start_test_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{}/api/scroll", addr))
            .json(&serde_json::json!({ "enabled": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        events
            .send(crate::host::HostEvent::Lifecycle(LifecycleEvent::TabUpdated {
                tab_id: TabId(1),
                change: ChangeInfo::default(),
                tab: TabInfo {
                    id: Some(TabId(1)),
                    url: Some("https://www.tiktok.com/@a/video/1".to_string()),
                    ..Default::default()
                },
            }))
            .unwrap();
        for _ in 0..200 {
            if handle.attachment_state(TabId(1)) == AttachmentState::Attached {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response: ScrollResponse = client
            .post(format!("http://{}/api/scroll", addr))
            .json(&serde_json::json!({ "tabId": 1, "enabled": true }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            response,
            ScrollResponse {
                tab_id: Some(TabId(1)),
                enabled: true
            }
        );

        let response: ScrollResponse = reqwest::get(format!("http://{}/api/scroll?tab=1", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.enabled);
    }

    #[tokio::test]
    async fn test_event_socket_pushes_events() {
        let (addr, handle, _events) = start_test_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        // the subscription is taken after the upgrade completes, so keep poking
        for _ in 0..50 {
            handle.activate(TabId(7)).unwrap();
            if let Ok(Some(Ok(message))) = tokio::time::timeout(Duration::from_millis(100), ws.next()).await {
                let text = message.into_text().unwrap();
                let event: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(event["type"], "active_tab_changed");
                assert_eq!(event["tabId"], 7);
                return;
            }
        }
        panic!("no event received over the socket");
    }
}
