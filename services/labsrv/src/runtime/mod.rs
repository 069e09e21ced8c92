//! Connection runtime
//!
//! - `transport`: dialing, listening, socket options
//! - `reconnect`: backoff policy and attempt counter
//! - `heartbeat`: keepalive and dead-peer decisions
//! - `connection`: per-key state, writer and send queue
//! - `session`: the task that owns a socket
//! - `manager`: public registry keyed by instrument identity

pub mod connection;
pub mod heartbeat;
pub mod manager;
pub mod reconnect;
mod session;
pub mod transport;

pub use connection::{ConnectionHandle, SendOutcome};
pub use heartbeat::HeartbeatAction;
pub use manager::ConnectionManager;
pub use reconnect::{ReconnectHelper, ReconnectPolicy, RetryDecision, MAX_RECONNECT_ATTEMPTS};
pub use session::SessionContext;
pub use transport::SocketOptions;
