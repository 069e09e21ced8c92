//! Shared bootstrap library for lab interface services
//!
//! - logging: console + daily rolling file subscriber
//! - shutdown: process signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig};
pub use shutdown::wait_for_shutdown;
