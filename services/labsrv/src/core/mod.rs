//! Core data model shared by the runtime, protocols and interpreter

pub mod health;
pub mod params;
pub mod result;
pub mod send_queue;
pub mod status;

pub use health::{ConnectionHealth, HealthSnapshot};
pub use params::{ConnectionKey, ConnectionParams, ProtocolKind, TransportMode};
pub use result::{NormalizedResult, RESULT_ACCEPTED, RESULT_PENDING};
pub use send_queue::{SendQueue, DEFAULT_SEND_QUEUE_CAPACITY};
pub use status::{ConnectionPhase, ConnectionStatus, StatusSnapshot, Transition};
