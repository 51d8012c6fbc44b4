pub mod error;
pub mod generation;
pub mod handlers;
pub mod init;
pub mod models;
pub mod streaming;
pub mod types;

pub use crate::init::{AppState, Config};
pub use crate::streaming::{BroadcastEvent, SessionRegistry, StreamCoordinator};
pub use crate::types::{ConnectionId, ConsumerRole, GenerationRequest, RequestId};
