use serde::Serialize;

use crate::types::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Lifecycle of one generation, owned by its session task.
#[derive(Debug)]
pub struct StreamSession {
    request_id: RequestId,
    state: SessionState,
    accumulated_text: String,
    fragments: usize,
}

impl StreamSession {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            state: SessionState::Pending,
            accumulated_text: String::new(),
            fragments: 0,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Pending -> Streaming once the provider stream is open.
    pub fn begin(&mut self) {
        debug_assert_eq!(self.state, SessionState::Pending);
        self.state = SessionState::Streaming;
    }

    /// Appends a fragment and returns the cumulative text so far.
    pub fn push(&mut self, fragment: &str) -> &str {
        debug_assert_eq!(self.state, SessionState::Streaming);
        self.accumulated_text.push_str(fragment);
        self.fragments += 1;
        &self.accumulated_text
    }

    pub fn complete(&mut self) -> String {
        self.state = SessionState::Completed;
        std::mem::take(&mut self.accumulated_text)
    }

    /// Marks the session failed and hands back the partial text for logging.
    pub fn fail(&mut self) -> String {
        self.state = SessionState::Failed;
        std::mem::take(&mut self.accumulated_text)
    }
}
