//! Laboratory Analyzer Interface Service (labsrv)
//!
//! Keeps long-lived TCP links to clinical analyzers speaking ASTM E1381/E1394
//! or HL7 v2 over MLLP, acknowledges their transmissions at the link level,
//! turns completed transmissions into normalized test results and hands them
//! to a result store. Test orders flow the other way over the same link.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌──────────────────┐
//! │ ConfigManager│──►│ ConnectionManager │──►│ session per key  │
//! │ (YAML/TOML)  │   │ (DashMap by key)  │   │ dial | listen    │
//! └──────────────┘   └───────────────────┘   └────────┬─────────┘
//!                                                     │ bytes
//!                                            ┌────────▼─────────┐
//!                                            │ ProtocolFramer   │── ACK/NAK/EOT
//!                                            └────────┬─────────┘
//!                                                     │ messages
//!                    ┌───────────────────┐   ┌────────▼─────────┐
//!                    │ ResultSink        │◄──│ Interpreter      │
//!                    │ (SQLite, memory)  │   │ (by machine type)│
//!                    └───────────────────┘   └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - **`core`**: connection parameters, phases, health counters, send queue
//! - **`protocols`**: ASTM and HL7 framing, acknowledgements, outbound orders
//! - **`interpreter`**: per-instrument result extraction strategies
//! - **`runtime`**: sockets, heartbeats, reconnect policy, connection registry
//! - **`storage`**: result sinks
//! - **`config`**: file and environment configuration

pub mod config;
pub mod core;
pub mod error;
pub mod interpreter;
pub mod protocols;
pub mod runtime;
pub mod storage;

pub use crate::config::{AppConfig, ConfigManager, ConnectionSettings, InstrumentConfig};
pub use crate::core::{
    ConnectionKey, ConnectionParams, ConnectionPhase, NormalizedResult, ProtocolKind, TransportMode,
};
pub use crate::error::{LabSrvError, Result};
pub use crate::interpreter::{InterpreterRegistry, MessageInterpreter};
pub use crate::protocols::{OrderPriority, OrderRequest};
pub use crate::runtime::{ConnectionManager, ReconnectPolicy, SendOutcome};
pub use crate::storage::{MemoryResultStore, ResultSink, SqliteResultStore};
