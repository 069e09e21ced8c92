//! Normalized lab result record

use serde::{Deserialize, Serialize};

/// Result status stored for accepted (final) results
pub const RESULT_ACCEPTED: i32 = 1;
/// Result status stored for anything not final
pub const RESULT_PENDING: i32 = 0;

/// One interpreted result, immutable once handed to persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub order_id: String,
    pub test_id: String,
    pub test_type: String,
    pub results: String,
    pub test_unit: String,
    pub tester_name: String,
    /// `YYYY-MM-DD HH:MM:SS`
    pub analysed_at: String,
    pub authorised_at: String,
    pub accepted_at: String,
    /// Untouched sub-message text the result was extracted from
    pub raw_text: String,
    /// 1 = accepted/final, 0 = pending
    pub result_status: i32,
    pub machine_id: String,
    pub lab_location: String,
}

impl NormalizedResult {
    pub fn is_accepted(&self) -> bool {
        self.result_status == RESULT_ACCEPTED
    }
}
