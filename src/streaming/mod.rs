// Public module exports
pub mod coordinator;
pub mod events;
pub mod registry;
pub mod session;

// Re-export main types for convenience
pub use coordinator::{CancellationToken, PreemptionPolicy, SessionSnapshot, StreamConfig, StreamCoordinator};
pub use events::{BookData, BookDataKind, BroadcastEvent, ControlEvent, Frame};
pub use registry::{ConsumerConnection, ConsumerInfo, SessionRegistry};
pub use session::{SessionState, StreamSession};
