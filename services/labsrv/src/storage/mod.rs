//! Result persistence collaborators
//!
//! Both calls are best-effort from the core's point of view: failures are
//! logged by the caller and never retried here.

mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::core::NormalizedResult;
use crate::error::Result;

pub use memory::MemoryResultStore;
pub use sqlite::SqliteResultStore;

/// Sink for raw captures and interpreted results
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store the untouched transmission text for audit
    async fn record_raw_transmission(&self, machine_id: &str, raw_text: &str) -> Result<()>;

    /// Store one interpreted result
    async fn record_result(&self, result: &NormalizedResult) -> Result<()>;
}
