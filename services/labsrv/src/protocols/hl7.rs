//! HL7 v2 object model, MLLP envelopes and acknowledgements

use chrono::Local;
use std::fmt;

use super::control::{self, CR, FS, VT};
use crate::error::{LabSrvError, Result};

/// Segment prefix that opens every HL7 message
pub const MESSAGE_HEADER: &str = "MSH|";

/// Acknowledgement code carried in MSA-1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept
    Accept,
    /// Application error
    Error,
    /// Application reject
    Reject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Accept => "AA",
            AckCode::Error => "AE",
            AckCode::Reject => "AR",
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding characters declared in MSH-1/MSH-2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separators {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Separators {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Separators {
    fn from_header(line: &str) -> Self {
        let mut seps = Separators::default();
        let mut chars = line.chars().skip(3);
        if let Some(field) = chars.next() {
            seps.field = field;
        }
        let encoding: Vec<char> = chars.take_while(|&c| c != seps.field).collect();
        if let Some(&c) = encoding.first() {
            seps.component = c;
        }
        if let Some(&c) = encoding.get(1) {
            seps.repetition = c;
        }
        if let Some(&c) = encoding.get(2) {
            seps.escape = c;
        }
        if let Some(&c) = encoding.get(3) {
            seps.subcomponent = c;
        }
        seps
    }
}

/// One parsed segment; `fields[0]` is the segment name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    fields: Vec<String>,
    component_separator: char,
    is_header: bool,
}

impl Segment {
    fn parse(line: &str, seps: &Separators) -> Self {
        let fields: Vec<String> = line.split(seps.field).map(str::to_string).collect();
        let is_header = fields.first().is_some_and(|name| name == "MSH");
        Self {
            fields,
            component_separator: seps.component,
            is_header,
        }
    }

    pub fn name(&self) -> &str {
        self.fields.first().map_or("", String::as_str)
    }

    /// Field by HL7 position (1-based). MSH-1 is the field separator
    /// itself, so MSH positions are shifted by one.
    pub fn field(&self, position: usize) -> &str {
        if position == 0 {
            return self.name();
        }
        let index = if self.is_header {
            if position == 1 {
                return "|";
            }
            position - 1
        } else {
            position
        };
        self.fields.get(index).map_or("", String::as_str)
    }

    /// Component of a field, both 1-based
    pub fn component(&self, position: usize, component: usize) -> &str {
        if component == 0 {
            return "";
        }
        self.field(position)
            .split(self.component_separator)
            .nth(component - 1)
            .unwrap_or("")
    }

    /// Number of fields after the segment name
    pub fn field_count(&self) -> usize {
        self.fields.len().saturating_sub(1)
    }
}

/// A parsed HL7 v2 message
#[derive(Debug, Clone)]
pub struct Hl7Message {
    separators: Separators,
    segments: Vec<Segment>,
    raw: String,
}

impl Hl7Message {
    /// Parse CR (or LF) separated segment text starting with MSH
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim_start_matches(|c: char| c.is_whitespace() || c.is_ascii_control());
        if !trimmed.starts_with("MSH") {
            return Err(LabSrvError::missing_segment("MSH"));
        }
        let header_line = trimmed.split(['\r', '\n']).next().unwrap_or_default();
        let separators = Separators::from_header(header_line);
        let segments: Vec<Segment> = trimmed
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| Segment::parse(line, &separators))
            .collect();

        Ok(Self {
            separators,
            segments,
            raw: trimmed.to_string(),
        })
    }

    pub fn separators(&self) -> &Separators {
        &self.separators
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All segments named `name`, in message order
    pub fn segments_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.name() == name)
    }

    pub fn first(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn header(&self) -> Option<&Segment> {
        self.first("MSH")
    }

    fn header_field(&self, position: usize) -> &str {
        self.header().map_or("", |msh| msh.field(position))
    }

    /// MSH-10
    pub fn control_id(&self) -> &str {
        self.header_field(10)
    }

    /// MSH-9.1
    pub fn message_code(&self) -> &str {
        self.header().map_or("", |msh| msh.component(9, 1))
    }

    /// MSH-9.2
    pub fn trigger_event(&self) -> &str {
        self.header().map_or("", |msh| msh.component(9, 2))
    }

    /// MSH-11
    pub fn processing_id(&self) -> &str {
        self.header_field(11)
    }

    /// MSH-12
    pub fn version(&self) -> &str {
        self.header_field(12)
    }
}

/// Wrap a message in an MLLP envelope: VT message FS CR
pub fn wrap(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 3);
    out.push(VT);
    out.extend_from_slice(message.as_bytes());
    out.push(FS);
    out.push(CR);
    out
}

/// Strip MLLP wrapper bytes and normalise segment terminators to CR.
///
/// Anything before the start block is dropped.
pub fn unwrap_message(text: &str) -> String {
    let body = match text.rfind(VT as char) {
        Some(pos) => &text[pos + 1..],
        None => text,
    };
    let cleaned = control::remove_control_characters(body);
    let normalized = control::normalize_line_breaks(&cleaned, '\r');
    normalized
        .trim_matches(|c: char| c == '\r' || c == ' ')
        .to_string()
}

/// Split text holding one or more messages on each `MSH|` start,
/// discarding empty fragments.
pub fn split_messages(text: &str) -> Vec<String> {
    text.split(MESSAGE_HEADER)
        .map(|part| part.trim_matches(|c: char| c == '\r' || c == '\n' || c == ' '))
        .filter(|part| !part.is_empty())
        .map(|part| format!("{MESSAGE_HEADER}{part}"))
        .collect()
}

fn hl7_timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Application acknowledgement for `message`, unwrapped.
///
/// Sending and receiving application/facility are swapped, the message
/// type becomes `ACK^<trigger>` and MSA echoes the original control id.
pub fn build_ack(message: &Hl7Message, code: AckCode) -> String {
    let msh = message.header();
    let field = |pos: usize| msh.map_or("", |m| m.field(pos));
    let processing = if message.processing_id().is_empty() {
        "P"
    } else {
        message.processing_id()
    };
    let version = if message.version().is_empty() {
        "2.5.1"
    } else {
        message.version()
    };
    let control_id = message.control_id();
    let message_type = if message.trigger_event().is_empty() {
        "ACK".to_string()
    } else {
        format!("ACK^{}", message.trigger_event())
    };

    format!(
        "MSH|^~\\&|{recv_app}|{recv_fac}|{send_app}|{send_fac}|{ts}||{message_type}|{control_id}|{processing}|{version}\rMSA|{code}|{control_id}\r",
        recv_app = field(5),
        recv_fac = field(6),
        send_app = field(3),
        send_fac = field(4),
        ts = hl7_timestamp(),
    )
}

/// Minimal ACK-shaped envelope used as an HL7 keepalive
pub fn keepalive_message() -> Vec<u8> {
    let ts = hl7_timestamp();
    wrap(&format!(
        "MSH|^~\\&|LABSRV||||{ts}||ACK|KA{ts}|P|2.5.1\rMSA|AA|KA{ts}\r"
    ))
}
