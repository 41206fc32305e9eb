//! Administrative request channel.
//!
//! Requests arrive as JSON objects tagged by `action` and are answered with an
//! [`AdminResponse`]. The binary feeds the channel from stdin, one request per
//! line.

use crate::orchestrator::{HarvestState, Orchestrator};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AdminRequest {
    ExportDiagnostics,
    ClearRetryQueue,
    FlushRetryQueue,
    ClearDiagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AdminResponse {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            message: None,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Parse one request line; malformed input becomes an error response
pub fn parse_request(line: &str) -> Result<AdminRequest, AdminResponse> {
    serde_json::from_str(line).map_err(|e| AdminResponse::error(format!("invalid request: {e}")))
}

pub async fn handle(orchestrator: &Orchestrator, request: AdminRequest) -> AdminResponse {
    debug!(?request, "admin request");
    match request {
        AdminRequest::ExportDiagnostics => {
            let entries = orchestrator.diagnostics().snapshot().await;
            let queue_length = orchestrator.queue().len().await;
            let configuration = orchestrator.current_config().await;
            let harvesting = matches!(orchestrator.state(), HarvestState::Running { .. });
            AdminResponse::ok(Some(json!({
                "entries": entries,
                "queueLength": queue_length,
                "configuration": configuration,
                "harvestInProgress": harvesting,
            })))
        }
        AdminRequest::ClearRetryQueue => {
            orchestrator.queue().clear().await;
            AdminResponse::ok(None)
        }
        AdminRequest::FlushRetryQueue => {
            let remaining = orchestrator.queue().flush().await;
            AdminResponse::ok(Some(json!({ "remaining": remaining })))
        }
        AdminRequest::ClearDiagnostics => {
            orchestrator.diagnostics().clear().await;
            info!("diagnostics cleared by administrator");
            AdminResponse::ok(None)
        }
    }
}

pub type AdminCommand = (AdminRequest, oneshot::Sender<AdminResponse>);

/// Sending half of the admin channel
#[derive(Clone)]
pub struct AdminHandle {
    commands: mpsc::Sender<AdminCommand>,
}

impl AdminHandle {
    /// `None` once the serving loop has stopped
    pub async fn request(&self, request: AdminRequest) -> Option<AdminResponse> {
        let (reply, response) = oneshot::channel();
        self.commands.send((request, reply)).await.ok()?;
        response.await.ok()
    }
}

pub fn channel(capacity: usize) -> (AdminHandle, mpsc::Receiver<AdminCommand>) {
    let (commands, receiver) = mpsc::channel(capacity);
    (AdminHandle { commands }, receiver)
}

/// Answer requests until every handle is dropped
pub async fn serve(orchestrator: Arc<Orchestrator>, mut commands: mpsc::Receiver<AdminCommand>) {
    while let Some((request, reply)) = commands.recv().await {
        let response = handle(&orchestrator, request).await;
        let _ = reply.send(response);
    }
    debug!("admin channel closed");
}
