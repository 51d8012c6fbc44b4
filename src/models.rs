use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{AppError, Result};
use crate::types::{ConnectionId, ConsumerRole, GenerationRequest, RequestId};

// ============================================================================
// INBOUND EVENTS
// ============================================================================

/// Frames a consumer may send, as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Chat(ChatPayload),
    Identify(IdentifyPayload),
    SketchSync(serde_json::Value),
    Disconnect,
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| AppError::bad_request(format!("unreadable event: {}", e)))
    }
}

/// Body of a `chat` event. The underscored aliases are what the reader
/// sketch has always sent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(default, alias = "_prompt")]
    pub prompt: String,
    #[serde(default, alias = "_system_prompt")]
    pub system_prompt: String,
    #[serde(default, alias = "_max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "_current_prompt")]
    pub sequence_index: u32,
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

impl ChatPayload {
    pub fn into_request(self, requester: ConnectionId, default_max_tokens: u32) -> GenerationRequest {
        GenerationRequest {
            request_id: self.request_id.unwrap_or_default(),
            requester,
            user_text: self.prompt,
            system_text: self.system_prompt,
            max_output_tokens: self.max_tokens.unwrap_or(default_max_tokens),
            sequence_index: self.sequence_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentifyPayload {
    pub role: String,
}

impl IdentifyPayload {
    pub fn role(&self) -> Result<ConsumerRole> {
        ConsumerRole::from_str(&self.role)
            .map_err(|_| AppError::bad_request(format!("unknown role '{}'", self.role)))
    }
}

// ============================================================================
// HTTP RESPONSES
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub provider: &'static str,
    pub consumers: usize,
}
