//! ASTM framing: checksums, outbound frames, sequence numbers and cleaning
//! of captured transmissions.
//!
//! Outbound frame layout:
//!
//! ```text
//! <STX> seq message <ETX> CS1 CS2 <CR> <LF> <EOT>
//!       └──────── summed ──────┘
//! ```

use dashmap::DashMap;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

use super::control::{self, ETB, ETX, STX};
use crate::core::ProtocolKind;

/// Token inserted before every header record so one EOT-delimited capture
/// can be split back into its message groups.
pub const MESSAGE_START_MARKER: &str = "<<ASTM-MESSAGE>>";

/// Value `reset` stores; the next framed message carries 101.
pub const SEQUENCE_RESET_VALUE: u32 = 100;

// Header record: optional frame digits, `H`, then the field delimiter
static HEADER_RECORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]*H[^A-Za-z0-9]").expect("static regex"));

// End-of-block (ETB/ETX) + two checksum characters + optional line terminator
static FRAME_TRAILER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x17\x03][0-9A-Fa-f]{2}(?:\r\n|\r|\n)?").expect("static regex")
});

// Frame start with its frame number
static FRAME_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x02[0-7]?").expect("static regex"));

/// Whether control-stripped text opens a new message group
pub fn is_header_record(stripped: &str) -> bool {
    HEADER_RECORD.is_match(stripped.trim_start())
}

/// ASTM checksum of a frame.
///
/// Sums the bytes after STX (if the frame starts with one) up to and
/// including the first ETX/ETB, keeps the low 8 bits and renders two
/// uppercase hex digits. Without an end byte the whole remainder is summed.
pub fn checksum(frame: &[u8]) -> String {
    let start = usize::from(frame.first() == Some(&STX));
    let body = &frame[start..];
    let end = body
        .iter()
        .position(|&b| b == ETX || b == ETB)
        .map_or(body.len(), |pos| pos + 1);
    let sum: u32 = body[..end].iter().map(|&b| u32::from(b)).sum();
    format!("{:02X}", sum & 0xFF)
}

/// Check the two characters following the end byte against a recomputed
/// checksum. Frames without an end byte or checksum fail.
pub fn verify_checksum(frame: &[u8]) -> bool {
    let Some(end) = frame.iter().position(|&b| b == ETX || b == ETB) else {
        return false;
    };
    let Some(embedded) = frame.get(end + 1..end + 3) else {
        return false;
    };
    let expected = checksum(&frame[..=end]);
    embedded.eq_ignore_ascii_case(expected.as_bytes())
}

/// Per-instrument outbound sequence numbers
#[derive(Debug, Default)]
pub struct SequenceRegistry {
    counters: DashMap<String, u32>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number for `instrument_id`, starting at 1
    pub fn next(&self, instrument_id: &str) -> u32 {
        let mut entry = self.counters.entry(instrument_id.to_string()).or_insert(0);
        *entry = entry.wrapping_add(1);
        *entry
    }

    /// Set the counter to the out-of-band reset value
    pub fn reset(&self, instrument_id: &str) {
        debug!("Sequence for {} reset to {}", instrument_id, SEQUENCE_RESET_VALUE);
        self.counters
            .insert(instrument_id.to_string(), SEQUENCE_RESET_VALUE);
    }

    /// Last number handed out, if any
    pub fn current(&self, instrument_id: &str) -> Option<u32> {
        self.counters.get(instrument_id).map(|v| *v)
    }
}

/// Frame an outbound message: STX + sequence, ETX, checksum, CR LF EOT.
pub fn frame_astm_message(sequences: &SequenceRegistry, instrument_id: &str, message: &str) -> String {
    let seq = sequences.next(instrument_id);
    let mut frame = String::with_capacity(message.len() + 16);
    frame.push(STX as char);
    frame.push_str(&seq.to_string());
    frame.push_str(message);
    frame.push(ETX as char);
    let cs = checksum(frame.as_bytes());
    frame.push_str(&cs);
    frame.push_str("\r\n");
    frame.push(control::EOT as char);
    frame
}

/// Turn a raw EOT-delimited capture into newline-separated record text.
///
/// For the checksummed variant, end-of-block markers with their checksum
/// and terminator are dropped along with frame starts, which re-joins
/// records split across ETB frames. Then control characters are removed
/// and line terminators collapse to single `\n`.
pub fn clean_transmission(raw: &str, protocol: ProtocolKind) -> String {
    let text = if protocol == ProtocolKind::AstmChecksum {
        let without_trailers = FRAME_TRAILER.replace_all(raw, "");
        FRAME_START.replace_all(&without_trailers, "").into_owned()
    } else {
        raw.to_string()
    };
    let cleaned = control::remove_control_characters(&text);
    control::normalize_line_breaks(&cleaned, '\n')
}

/// Split a cleaned capture into message groups on the start marker,
/// dropping empty fragments.
pub fn split_messages(cleaned: &str) -> Vec<String> {
    cleaned
        .split(MESSAGE_START_MARKER)
        .map(|part| part.trim_matches(|c| c == '\n' || c == ' '))
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
