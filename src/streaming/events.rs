use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, ErrorCode};
use crate::types::{ConnectionId, RequestId};

/// Events of one generation session, fanned out to every consumer.
///
/// Wire form is `{"event": "stream-chunk", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    #[serde(rename_all = "camelCase")]
    StreamStart {
        request_id: RequestId,
        sequence_index: u32,
    },

    #[serde(rename_all = "camelCase")]
    StreamChunk {
        request_id: RequestId,
        chunk: String,
        cumulative_text: String,
    },

    #[serde(rename_all = "camelCase")]
    StreamComplete {
        request_id: RequestId,
        final_text: String,
        sequence_index: u32,
        timestamp: i64,
    },

    #[serde(rename_all = "camelCase")]
    StreamError {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        code: ErrorCode,
        message: String,
    },
}

impl BroadcastEvent {
    pub fn error(request_id: Option<RequestId>, error: &AppError) -> Self {
        Self::StreamError {
            request_id,
            code: error.code,
            message: error.message.clone(),
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::StreamStart { request_id, .. }
            | Self::StreamChunk { request_id, .. }
            | Self::StreamComplete { request_id, .. } => Some(request_id),
            Self::StreamError { request_id, .. } => request_id.as_ref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamComplete { .. } | Self::StreamError { .. })
    }
}

/// Connection-level events that are not part of a generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ControlEvent {
    /// First frame on every connection.
    #[serde(rename_all = "camelCase")]
    Start { connection_id: ConnectionId },

    /// Sketch state relayed from another consumer.
    SketchUpdate(serde_json::Value),

    /// Finished text for the visualization sketches, sent just ahead of
    /// `stream-complete`.
    BookData(BookData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookDataKind {
    NewText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookData {
    #[serde(rename = "type")]
    pub kind: BookDataKind,
    pub content: String,
    pub prompt_index: u32,
    pub timestamp: i64,
    pub request_id: RequestId,
}

/// One encoded outbound message, shared by every consumer it is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn encode<T: Serialize>(event: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_string(event).map(|json| Self(json.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn decode<'a, T: Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.0)
    }
}
