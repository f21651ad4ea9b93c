//! Interception Gateway
//!
//! Handles every exchange the host intercepts. Comment list responses on
//! attached tabs, or tabs whose attach is finishing, are decoded and sent to the coordinator for merging;
//! everything else is passed straight through. Either way the exchange is
//! resumed exactly once, after any body fetch, because an exchange that is
//! never resumed stalls the page's own request.

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::coordinator::CoordinatorMsg;
use super::decoder::decode_comments;
use super::error::CaptureError;
use super::registry::{CaptureTarget, SessionRegistry};
use super::site::SiteMatcher;
use super::types::{Comment, TabId};
use crate::host::{DebuggerHost, InterceptedExchange};

/// Comments decoded from one exchange, tagged with the session they belong to
#[derive(Debug)]
pub struct CapturedBatch {
    pub tab_id: TabId,
    pub target: CaptureTarget,
    pub comments: Vec<Comment>,
}

#[derive(Clone)]
pub struct InterceptionGateway {
    host: Arc<dyn DebuggerHost>,
    registry: SessionRegistry,
    site: Arc<SiteMatcher>,
    coordinator: mpsc::UnboundedSender<CoordinatorMsg>,
}

impl InterceptionGateway {
    pub fn new(
        host: Arc<dyn DebuggerHost>,
        registry: SessionRegistry,
        site: Arc<SiteMatcher>,
        coordinator: mpsc::UnboundedSender<CoordinatorMsg>,
    ) -> Self {
        Self {
            host,
            registry,
            site,
            coordinator,
        }
    }

    /// Take ownership of an exchange and resume it on its own task.
    ///
    /// The capture target is read now so a batch is tied to the session and
    /// subject that were current when the exchange arrived.
    pub fn dispatch(&self, exchange: InterceptedExchange) {
        let target = if self.site.matches_api(&exchange.request_url) {
            self.registry.capture_target(exchange.tab_id)
        } else {
            None
        };

        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.handle(exchange, target).await;
        });
    }

    async fn handle(&self, exchange: InterceptedExchange, target: Option<CaptureTarget>) {
        match target {
            Some(target) => self.capture(&exchange, target).await,
            None => debug!(
                "Passing through {} on tab {}",
                exchange.interception_id, exchange.tab_id
            ),
        }

        let tab_id = exchange.tab_id;
        let interception_id = exchange.interception_id.clone();
        if let Err(e) = exchange.resume(self.host.as_ref()).await {
            warn!("Failed to resume {} on tab {}: {}", interception_id, tab_id, e);
        }
    }

    async fn capture(&self, exchange: &InterceptedExchange, target: CaptureTarget) {
        let tab_id = exchange.tab_id;

        let body = match self
            .host
            .get_response_body(tab_id, &exchange.interception_id)
            .await
        {
            Ok(body) => body,
            Err(e) => {
                let err = CaptureError::from_host(tab_id, "get_response_body", e);
                warn!("{}", err);
                return;
            }
        };

        let comments = match decode_comments(&body) {
            Ok(comments) => comments,
            Err(e) => {
                warn!("Ignoring response on tab {}: {}", tab_id, e);
                return;
            }
        };

        if comments.is_empty() {
            debug!("No comments in {} on tab {}", exchange.interception_id, tab_id);
            return;
        }

        let batch = CapturedBatch {
            tab_id,
            target,
            comments,
        };
        if self.coordinator.send(CoordinatorMsg::Captured(batch)).is_err() {
            debug!("Coordinator gone, dropping batch for tab {}", tab_id);
        }
    }
}
