use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::dto::job::{JobEnvelope, ModifyTask};

#[derive(Debug, Deserialize, Serialize, ToSchema)]
/// Messages accepted from capture WebSocket clients.
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CaptureInboundMessage {
    /// Must be the first frame; binds the socket to a session.
    #[serde(rename_all = "camelCase")]
    Connect { connect_code: String },
    /// A game event to enqueue for the session loop.
    Job { job: JobEnvelope },
    /// Answer to a previously forwarded [`ModifyTask`].
    #[serde(rename_all = "camelCase")]
    TaskAck { task_id: String, success: bool },
    #[serde(other)]
    Unknown,
}

impl CaptureInboundMessage {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Messages pushed to capture clients.
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CaptureOutboundMessage {
    /// Sent once the socket is bound to a session.
    #[serde(rename_all = "camelCase")]
    Connected { connect_code: String },
    /// A session loop is consuming the queue.
    Listening,
    /// Apply a voice change on behalf of the session.
    Modify(ModifyTask),
}
