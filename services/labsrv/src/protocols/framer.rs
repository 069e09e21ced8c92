//! Inbound reassembly and link-level replies
//!
//! One [`ProtocolFramer`] per connection. It never touches the socket:
//! each chunk yields a [`FramerOutput`] naming the bytes to write back and
//! the logical messages that completed, and the session applies both.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use super::astm;
use super::control::{self, ACK, ENQ, EOT, FS, NAK, VT};
use super::hl7::{self, AckCode, Hl7Message};
use crate::core::ProtocolKind;

/// Result of feeding one inbound chunk
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FramerOutput {
    /// Replies to write back, in order
    pub replies: Vec<Bytes>,
    /// Completed logical messages: raw captures for ASTM, normalised
    /// segment text for HL7
    pub messages: Vec<String>,
    /// New value for the *transmitting* signal, if it changed
    pub transmitting: Option<bool>,
}

impl FramerOutput {
    fn reply(&mut self, bytes: &'static [u8]) {
        self.replies.push(Bytes::from_static(bytes));
    }
}

/// Per-connection accumulation buffer and link state
///
/// Raw bytes are kept until a terminator completes the message, so a
/// multi-byte character split across reads decodes intact.
#[derive(Debug)]
pub struct ProtocolFramer {
    protocol: ProtocolKind,
    buffer: BytesMut,
    keepalive_outstanding: bool,
}

impl ProtocolFramer {
    pub fn new(protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            buffer: BytesMut::new(),
            keepalive_outstanding: false,
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Bytes accumulated since the last terminator
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop partial state, e.g. when a new socket replaces the old one
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.keepalive_outstanding = false;
    }

    /// Keepalive frame for this protocol: bare ENQ for ASTM, an ACK-shaped
    /// envelope for HL7.
    pub fn keepalive_frame(&mut self) -> Bytes {
        if self.protocol.is_astm() {
            self.keepalive_outstanding = true;
            Bytes::from_static(&[ENQ])
        } else {
            Bytes::from(hl7::keepalive_message())
        }
    }

    /// Feed one inbound chunk
    pub fn on_chunk(&mut self, chunk: &[u8]) -> FramerOutput {
        let mut out = FramerOutput::default();
        if chunk.is_empty() {
            return out;
        }
        if self.protocol.is_astm() {
            self.on_astm_chunk(chunk, &mut out);
        } else {
            self.on_hl7_chunk(chunk, &mut out);
        }
        out
    }

    fn on_astm_chunk(&mut self, chunk: &[u8], out: &mut FramerOutput) {
        if control::is_bare(chunk, NAK) {
            warn!("NAK received from instrument, acknowledging");
            out.reply(&[ACK]);
            return;
        }
        if control::is_bare(chunk, ACK) {
            if self.keepalive_outstanding {
                debug!("Keepalive answered, releasing line");
                self.keepalive_outstanding = false;
                out.reply(&[EOT]);
            }
            return;
        }
        if control::is_bare(chunk, ENQ) {
            debug!("ENQ received, line bid accepted");
            out.transmitting = Some(true);
            out.reply(&[ACK]);
            return;
        }

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == EOT) {
            if pos > 0 {
                self.append_astm(&rest[..pos], out);
            }
            self.finish_astm(out);
            rest = &rest[pos + 1..];
        }
        if !rest.is_empty() {
            self.append_astm(rest, out);
        }
    }

    fn append_astm(&mut self, data: &[u8], out: &mut FramerOutput) {
        let stripped = control::remove_control_characters(&String::from_utf8_lossy(data));
        if astm::is_header_record(&stripped) {
            self.buffer.extend_from_slice(astm::MESSAGE_START_MARKER.as_bytes());
        }
        self.buffer.extend_from_slice(data);
        debug!("ASTM chunk buffered: {}", control::describe_bytes(data));
        out.transmitting = Some(true);
        out.reply(&[ACK]);
    }

    fn finish_astm(&mut self, out: &mut FramerOutput) {
        out.reply(&[ACK]);
        out.transmitting = Some(false);
        let raw = self.buffer.split();
        let capture = String::from_utf8_lossy(&raw).into_owned();
        if control::remove_control_characters(&capture).trim().is_empty() {
            debug!("EOT with empty buffer");
            return;
        }
        debug!("ASTM transmission complete ({} bytes)", capture.len());
        out.messages.push(capture);
    }

    fn on_hl7_chunk(&mut self, chunk: &[u8], out: &mut FramerOutput) {
        if chunk.contains(&VT) {
            out.transmitting = Some(true);
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == FS) {
            let raw = self.buffer.split_to(pos);
            self.buffer.advance(1);
            let skip = self
                .buffer
                .iter()
                .take_while(|&&b| b == b'\r' || b == b'\n')
                .count();
            self.buffer.advance(skip);
            let envelope = String::from_utf8_lossy(&raw);
            out.transmitting = Some(false);

            let message = hl7::unwrap_message(&envelope);
            if message.is_empty() {
                continue;
            }
            match Hl7Message::parse(&message) {
                Ok(parsed) => {
                    debug!("HL7 message {} complete", parsed.control_id());
                    let ack = hl7::build_ack(&parsed, AckCode::Accept);
                    out.replies.push(Bytes::from(hl7::wrap(&ack)));
                },
                Err(e) => warn!("HL7 message without usable header, not acknowledged: {}", e),
            }
            out.messages.push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::control::{CR, ETX, STX};
    use tracing_test::traced_test;

    fn ack() -> Bytes {
        Bytes::from_static(&[ACK])
    }

    #[test]
    fn test_chunks_accumulate_until_eot() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmChecksum);
        let chunks: [&[u8]; 3] = [b"\x021H|\\^&|||LAB\r", b"P|1||||ORD1\r", b"L|1|N\r\x03A0\r\n"];
        for chunk in chunks {
            let out = framer.on_chunk(chunk);
            assert!(out.messages.is_empty());
            assert_eq!(out.replies, vec![ack()]);
            assert_eq!(out.transmitting, Some(true));
        }

        let out = framer.on_chunk(&[EOT]);
        assert_eq!(out.replies, vec![ack()]);
        assert_eq!(out.transmitting, Some(false));
        assert_eq!(out.messages.len(), 1);
        let expected = format!(
            "{}\x021H|\\^&|||LAB\rP|1||||ORD1\rL|1|N\r\x03A0\r\n",
            astm::MESSAGE_START_MARKER
        );
        assert_eq!(out.messages[0], expected);
        assert!(framer.buffered().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_bare_nak_is_acked_and_not_buffered() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmNonChecksum);
        framer.on_chunk(b"1H|\\^&\r");
        let before = framer.buffered().to_vec();
        let out = framer.on_chunk(&[NAK]);
        assert_eq!(out.replies, vec![ack()]);
        assert_eq!(framer.buffered(), before);
        assert!(logs_contain("NAK received"));
    }

    #[test]
    fn test_bare_enq_sets_transmitting() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmChecksum);
        let out = framer.on_chunk(&[ENQ]);
        assert_eq!(out.replies, vec![ack()]);
        assert_eq!(out.transmitting, Some(true));
        assert!(framer.buffered().is_empty());
    }

    #[test]
    fn test_ack_releases_line_only_after_keepalive() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmChecksum);
        assert!(framer.on_chunk(&[ACK]).replies.is_empty());

        assert_eq!(framer.keepalive_frame(), Bytes::from_static(&[ENQ]));
        let out = framer.on_chunk(&[ACK]);
        assert_eq!(out.replies, vec![Bytes::from_static(&[EOT])]);
        // second ACK is not answered again
        assert!(framer.on_chunk(&[ACK]).replies.is_empty());
    }

    #[test]
    fn test_trailing_eot_in_data_chunk() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmChecksum);
        let mut chunk = vec![STX];
        chunk.extend_from_slice(b"1H|\\^&\rL|1|N\r");
        chunk.extend_from_slice(&[ETX, b'0', b'0', CR, b'\n', EOT]);
        let out = framer.on_chunk(&chunk);
        assert_eq!(out.replies, vec![ack(), ack()]);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.transmitting, Some(false));
    }

    #[test]
    fn test_batch_gets_one_marker_per_header() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmNonChecksum);
        framer.on_chunk(b"1H|\\^&\r");
        framer.on_chunk(b"2L|1|N\r");
        framer.on_chunk(b"3H|\\^&\r");
        framer.on_chunk(b"4L|1|N\r");
        let out = framer.on_chunk(&[EOT]);
        assert_eq!(out.messages[0].matches(astm::MESSAGE_START_MARKER).count(), 2);
    }

    #[test]
    fn test_eot_with_empty_buffer_emits_nothing() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmChecksum);
        let out = framer.on_chunk(&[EOT]);
        assert!(out.messages.is_empty());
        assert_eq!(out.replies, vec![ack()]);
    }

    #[test]
    fn test_hl7_accumulates_until_fs() {
        let mut framer = ProtocolFramer::new(ProtocolKind::Hl7);
        let out = framer.on_chunk(b"\x0bMSH|^~\\&|DEV|FAC|LIS|LAB|20240101||ORU^R01|C7|P|2.5.1\r\n");
        assert!(out.messages.is_empty());
        assert!(out.replies.is_empty());
        assert_eq!(out.transmitting, Some(true));

        let out = framer.on_chunk(b"OBX|1|NM|VL||55|cp/mL\r\x1c\r");
        assert_eq!(out.messages.len(), 1);
        assert_eq!(
            out.messages[0],
            "MSH|^~\\&|DEV|FAC|LIS|LAB|20240101||ORU^R01|C7|P|2.5.1\rOBX|1|NM|VL||55|cp/mL"
        );
        assert_eq!(out.replies.len(), 1);
        let ack_text = hl7::unwrap_message(&String::from_utf8_lossy(&out.replies[0]));
        assert!(ack_text.contains("MSA|AA|C7"));
        assert!(framer.buffered().is_empty());
    }

    #[test]
    fn test_hl7_keeps_bytes_after_separator() {
        let mut framer = ProtocolFramer::new(ProtocolKind::Hl7);
        let out = framer.on_chunk(b"\x0bMSH|^~\\&|A||B||1||ORU^R01|X1|P|2.5\r\x1c\r\x0bMSH|^~\\&|A");
        assert_eq!(out.messages.len(), 1);
        assert_eq!(framer.buffered(), b"\x0bMSH|^~\\&|A");
    }

    #[test]
    fn test_hl7_keepalive_frame() {
        let mut framer = ProtocolFramer::new(ProtocolKind::Hl7);
        let frame = framer.keepalive_frame();
        assert_eq!(frame[0], VT);
    }

    #[test]
    fn test_astm_character_split_across_reads_survives() {
        let mut framer = ProtocolFramer::new(ProtocolKind::AstmNonChecksum);
        let text = "1H|\\^&\rP|1||||ORD|Jos\u{e9}\r".as_bytes();
        let split = text.len() - 2;
        assert_eq!(text[split - 1], 0xC3);
        framer.on_chunk(&text[..split]);
        framer.on_chunk(&text[split..]);
        let out = framer.on_chunk(&[EOT]);
        assert!(out.messages[0].ends_with("ORD|Jos\u{e9}\r"));
        assert!(!out.messages[0].contains('\u{fffd}'));
    }

    #[test]
    fn test_hl7_character_split_across_reads_survives() {
        let mut framer = ProtocolFramer::new(ProtocolKind::Hl7);
        let text = "\x0bMSH|^~\\&|A||B||1||ORU^R01|X2|P|2.5\rPID|1||||Jos\u{e9}\r\x1c\r".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(framer.on_chunk(&text[..split]).messages.is_empty());
        let out = framer.on_chunk(&text[split..]);
        assert_eq!(out.messages.len(), 1);
        assert!(out.messages[0].contains("PID|1||||Jos\u{e9}"));
    }
}
