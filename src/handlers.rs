use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::error::*;
use crate::init::AppState;
use crate::models::{ClientEvent, HealthResponse};
use crate::streaming::{
    BroadcastEvent, ConsumerConnection, ConsumerInfo, ControlEvent, Frame, SessionSnapshot,
};
use crate::types::{ConnectionId, ConsumerRole};

// ============================================================================
// HTTP HANDLERS
// ============================================================================

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider: state.provider,
        consumers: state.registry.len().await,
    })
}

pub async fn list_consumers(State(state): State<Arc<AppState>>) -> Json<Vec<ConsumerInfo>> {
    Json(state.registry.consumers().await)
}

pub async fn active_session(State(state): State<Arc<AppState>>) -> Result<Json<SessionSnapshot>> {
    state
        .coordinator
        .active_session()
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("Active generation session"))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// GET /ws
///
/// One consumer per socket. Frames are JSON `{"event", "data"}` envelopes.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbox) = ConsumerConnection::new(ConsumerRole::default());
    let id = connection.id;

    // `start` goes in ahead of registration so it is always the first frame
    match Frame::encode(&ControlEvent::Start { connection_id: id }) {
        Ok(frame) => {
            connection.send(frame);
        }
        Err(e) => log::error!("failed to encode start frame: {}", e),
    }
    state.registry.register(connection).await;

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sender.send(Message::Text(frame.as_str().into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !dispatch(&state, id, text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("socket {} errored: {}", id, e);
                    break;
                }
            },
        }
    }

    state.registry.unregister(&id).await;
    writer.abort();
}

/// Handles one inbound frame. Returns false when the consumer is leaving.
async fn dispatch(state: &AppState, id: ConnectionId, text: &str) -> bool {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(err) => {
            reply_error(state, id, &err).await;
            return true;
        }
    };

    match event {
        ClientEvent::Chat(payload) => {
            let request = payload.into_request(id, state.coordinator.config().default_max_tokens);
            log::info!("💬 chat from {} (request {})", id, request.request_id);
            match state.coordinator.submit(request).await {
                Ok(request_id) => log::debug!("request {} accepted from {}", request_id, id),
                Err(err) => log::debug!("request from {} refused: {}", id, err),
            }
        }
        ClientEvent::Identify(payload) => match payload.role() {
            Ok(role) => {
                state.registry.identify(&id, role).await;
            }
            Err(err) => reply_error(state, id, &err).await,
        },
        ClientEvent::SketchSync(data) => match Frame::encode(&ControlEvent::SketchUpdate(data)) {
            Ok(frame) => {
                let relayed = state.registry.broadcast_except(&id, &frame).await;
                log::debug!("🎨 sketch-sync from {} relayed to {}", id, relayed);
            }
            Err(e) => log::error!("failed to encode sketch update: {}", e),
        },
        ClientEvent::Disconnect => return false,
    }
    true
}

async fn reply_error(state: &AppState, id: ConnectionId, err: &AppError) {
    log_error(err);
    let frame = Frame::encode(&BroadcastEvent::error(None, err)).context("encoding error reply");
    match frame {
        Ok(frame) => {
            state.registry.send_to(&id, frame).await;
        }
        Err(e) => log_error(&e),
    }
}
