use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::error::{Result, ValidationError, ValidationErrors};
use crate::generation::GenerationPrompt;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque token naming one generation request. Clients may supply their own
/// so they can correlate replies; otherwise the server mints a UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Consumer Role
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ConsumerRole {
    /// Originates generation requests. Connections that never identify are
    /// treated as requesters, like the reader page.
    #[default]
    Requester,
    /// Receives broadcasts but never submits requests.
    Observer,
}

// ============================================================================
// Generation Request
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub request_id: RequestId,
    pub requester: ConnectionId,
    pub user_text: String,
    pub system_text: String,
    pub max_output_tokens: u32,
    pub sequence_index: u32,
}

impl GenerationRequest {
    /// Checks the request shape against the configured output bound.
    pub fn validate(&self, max_output_tokens_limit: u32) -> Result<()> {
        let mut errors = ValidationErrors::new();

        if self.system_text.trim().is_empty() {
            errors.add(ValidationError::new("systemPrompt", "must not be empty").with_code("EMPTY"));
        }
        if self.user_text.trim().is_empty() {
            errors.add(ValidationError::new("prompt", "must not be empty").with_code("EMPTY"));
        }
        if self.max_output_tokens == 0 {
            errors.add(ValidationError::new("maxTokens", "must be at least 1").with_code("RANGE"));
        } else if self.max_output_tokens > max_output_tokens_limit {
            errors.add(
                ValidationError::new(
                    "maxTokens",
                    format!("must not exceed {}", max_output_tokens_limit),
                )
                .with_code("RANGE"),
            );
        }

        errors.into_result()
    }

    pub fn prompt(&self) -> GenerationPrompt {
        GenerationPrompt {
            system_text: self.system_text.clone(),
            user_text: self.user_text.clone(),
            max_output_tokens: self.max_output_tokens,
        }
    }
}
