use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::sync::{watch, Mutex};

use super::events::{BookData, BookDataKind, BroadcastEvent, ControlEvent, Frame};
use super::registry::SessionRegistry;
use super::session::StreamSession;
use crate::error::{log_error, AppError, Result};
use crate::generation::GenerationClient;
use crate::types::{ConnectionId, ConsumerRole, GenerationRequest, RequestId};

// ============================================================================
// CANCELLATION TOKEN
// ============================================================================

#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            cancelled: Arc::new(tx),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.subscribe();
        // the sender lives in `self`, so this cannot close early
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// What to do with a request that arrives while another is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PreemptionPolicy {
    /// Cancel the in-flight generation and start the new one.
    #[default]
    Preempt,
    /// Answer the newcomer with `BUSY` and leave the in-flight one alone.
    Reject,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub default_max_tokens: u32,
    pub max_output_tokens_limit: u32,
    pub policy: PreemptionPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 20,
            max_output_tokens_limit: 4096,
            policy: PreemptionPolicy::Preempt,
        }
    }
}

// ============================================================================
// ACTIVE SESSION SLOT
// ============================================================================

struct ActiveSession {
    epoch: u64,
    request_id: RequestId,
    requester: ConnectionId,
    sequence_index: u32,
    started_at: DateTime<Utc>,
    token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub request_id: RequestId,
    pub requester: ConnectionId,
    pub sequence_index: u32,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// STREAM COORDINATOR
// ============================================================================

/// Runs one generation at a time and fans its events out to every consumer.
///
/// The active slot doubles as the emission gate: a session task only
/// broadcasts while it still owns the slot, and holds the slot lock for the
/// whole hand-off to the registry. Once a newer request has claimed the slot
/// the superseded task can no longer emit anything.
pub struct StreamCoordinator {
    registry: Arc<SessionRegistry>,
    client: Arc<dyn GenerationClient>,
    config: StreamConfig,
    active: Mutex<Option<ActiveSession>>,
    epochs: AtomicU64,
}

impl StreamCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        client: Arc<dyn GenerationClient>,
        config: StreamConfig,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            active: Mutex::new(None),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Accepts a request and spawns its session task.
    ///
    /// Validation and `BUSY` failures are answered to the requester only and
    /// returned; no session is created for them.
    pub async fn submit(self: &Arc<Self>, request: GenerationRequest) -> Result<RequestId> {
        if let Err(err) = self.check(&request).await {
            return self.refuse(&request, err).await;
        }

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            match self.config.policy {
                PreemptionPolicy::Reject => {
                    let err = AppError::busy(&current.request_id);
                    drop(active);
                    return self.refuse(&request, err).await;
                }
                PreemptionPolicy::Preempt => {
                    log::info!(
                        "✂️  request {} supersedes {}",
                        request.request_id,
                        current.request_id
                    );
                    current.token.cancel();
                }
            }
        }

        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *active = Some(ActiveSession {
            epoch,
            request_id: request.request_id.clone(),
            requester: request.requester,
            sequence_index: request.sequence_index,
            started_at: Utc::now(),
            token: token.clone(),
        });
        drop(active);

        let request_id = request.request_id.clone();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_session(request, epoch, token).await;
        });

        Ok(request_id)
    }

    pub async fn active_session(&self) -> Option<SessionSnapshot> {
        self.active.lock().await.as_ref().map(|s| SessionSnapshot {
            request_id: s.request_id.clone(),
            requester: s.requester,
            sequence_index: s.sequence_index,
            started_at: s.started_at,
        })
    }

    /// Cancels the in-flight generation, if any. Nothing more is emitted for it.
    pub async fn shutdown(&self) {
        if let Some(session) = self.active.lock().await.take() {
            log::info!("🛑 cancelling session {} for shutdown", session.request_id);
            session.token.cancel();
        }
    }

    async fn check(&self, request: &GenerationRequest) -> Result<()> {
        if self.registry.role_of(&request.requester).await == Some(ConsumerRole::Observer) {
            return Err(AppError::validation(
                "observers cannot submit generation requests",
            ));
        }
        request.validate(self.config.max_output_tokens_limit)
    }

    async fn refuse(&self, request: &GenerationRequest, err: AppError) -> Result<RequestId> {
        log_error(&err);
        let event = BroadcastEvent::error(Some(request.request_id.clone()), &err);
        match Frame::encode(&event) {
            Ok(frame) => {
                if !self.registry.send_to(&request.requester, frame).await {
                    log::debug!("requester {} left before refusal", request.requester);
                }
            }
            Err(e) => log::error!("failed to encode refusal: {}", e),
        }
        Err(err)
    }

    async fn run_session(
        self: Arc<Self>,
        request: GenerationRequest,
        epoch: u64,
        token: CancellationToken,
    ) {
        let mut session = StreamSession::new(request.request_id.clone());
        let mut fragments = self.client.generate(&request.prompt());
        session.begin();

        log::info!(
            "🚀 session {} streaming from {} (sequence {}, {} max tokens)",
            session.request_id(),
            self.client.name(),
            request.sequence_index,
            request.max_output_tokens
        );

        let start = BroadcastEvent::StreamStart {
            request_id: session.request_id().clone(),
            sequence_index: request.sequence_index,
        };
        if !self.emit(epoch, None, &start, false).await {
            return;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::info!(
                        "✂️  session {} cancelled after {} fragments",
                        session.request_id(),
                        session.fragments()
                    );
                    return;
                }
                next = fragments.next() => next,
            };

            let mut book_data = None;
            let (event, terminal) = match next {
                Some(Ok(fragment)) => {
                    let cumulative_text = session.push(&fragment).to_string();
                    log::trace!("session {} fragment {:?}", session.request_id(), fragment);
                    let event = BroadcastEvent::StreamChunk {
                        request_id: session.request_id().clone(),
                        chunk: fragment,
                        cumulative_text,
                    };
                    (event, false)
                }
                Some(Err(err)) => {
                    let fragments_seen = session.fragments();
                    let partial = session.fail();
                    log::error!(
                        "❌ session {} failed after {} fragments: {}",
                        session.request_id(),
                        fragments_seen,
                        err
                    );
                    log::debug!("session {} partial text: {:?}", session.request_id(), partial);
                    let err = AppError::from(err);
                    (BroadcastEvent::error(Some(session.request_id().clone()), &err), true)
                }
                None => {
                    let fragments_seen = session.fragments();
                    let final_text = session.complete();
                    let timestamp = Utc::now().timestamp_millis();
                    log::info!(
                        "✅ session {} completed ({} fragments, {} chars)",
                        session.request_id(),
                        fragments_seen,
                        final_text.len()
                    );
                    book_data = Some(ControlEvent::BookData(BookData {
                        kind: BookDataKind::NewText,
                        content: final_text.clone(),
                        prompt_index: request.sequence_index,
                        timestamp,
                        request_id: session.request_id().clone(),
                    }));
                    let event = BroadcastEvent::StreamComplete {
                        request_id: session.request_id().clone(),
                        final_text,
                        sequence_index: request.sequence_index,
                        timestamp,
                    };
                    (event, true)
                }
            };

            if !self.emit(epoch, book_data.as_ref(), &event, terminal).await || terminal {
                return;
            }
            // let connects and disconnects run before the next fragment
            tokio::task::yield_now().await;
        }
    }

    /// Broadcasts `preface` then `event` if session `epoch` still owns the
    /// slot. A terminal event releases the slot under the same lock.
    async fn emit(
        &self,
        epoch: u64,
        preface: Option<&ControlEvent>,
        event: &BroadcastEvent,
        terminal: bool,
    ) -> bool {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|s| s.epoch) != Some(epoch) {
            return false;
        }

        if let Some(preface) = preface {
            match Frame::encode(preface) {
                Ok(frame) => {
                    self.registry.broadcast(&frame).await;
                }
                Err(e) => log::error!("failed to encode event: {}", e),
            }
        }
        match Frame::encode(event) {
            Ok(frame) => {
                let delivered = self.registry.broadcast(&frame).await;
                log::debug!("📡 {:?} -> {} consumers", event.request_id(), delivered);
            }
            Err(e) => log::error!("failed to encode event: {}", e),
        }

        if terminal {
            *active = None;
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================
