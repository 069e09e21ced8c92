use async_trait::async_trait;
use parking_lot::Mutex;

use super::ResultSink;
use crate::core::NormalizedResult;
use crate::error::Result;

/// In-process store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    raw: Mutex<Vec<(String, String)>>,
    results: Mutex<Vec<NormalizedResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(machine_id, raw_text)` in arrival order
    pub fn raw_transmissions(&self) -> Vec<(String, String)> {
        self.raw.lock().clone()
    }

    pub fn results(&self) -> Vec<NormalizedResult> {
        self.results.lock().clone()
    }

    pub fn clear(&self) {
        self.raw.lock().clear();
        self.results.lock().clear();
    }
}

#[async_trait]
impl ResultSink for MemoryResultStore {
    async fn record_raw_transmission(&self, machine_id: &str, raw_text: &str) -> Result<()> {
        self.raw
            .lock()
            .push((machine_id.to_string(), raw_text.to_string()));
        Ok(())
    }

    async fn record_result(&self, result: &NormalizedResult) -> Result<()> {
        self.results.lock().push(result.clone());
        Ok(())
    }
}
