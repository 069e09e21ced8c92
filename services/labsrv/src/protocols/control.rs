//! Link-control bytes and text cleaning shared by ASTM and HL7

/// Start of text (ASTM frame start)
pub const STX: u8 = 0x02;
/// End of text (ASTM last frame end)
pub const ETX: u8 = 0x03;
/// End of transmission
pub const EOT: u8 = 0x04;
/// Enquiry (ASTM line bid, used as keepalive)
pub const ENQ: u8 = 0x05;
/// Acknowledge
pub const ACK: u8 = 0x06;
/// Vertical tab (MLLP start block)
pub const VT: u8 = 0x0B;
/// Line feed
pub const LF: u8 = 0x0A;
/// Carriage return
pub const CR: u8 = 0x0D;
/// Negative acknowledge
pub const NAK: u8 = 0x15;
/// End of transmission block (ASTM intermediate frame end)
pub const ETB: u8 = 0x17;
/// File separator (MLLP end block)
pub const FS: u8 = 0x1C;

/// Whether `chunk` is exactly one control byte
pub fn is_bare(chunk: &[u8], byte: u8) -> bool {
    chunk.len() == 1 && chunk[0] == byte
}

/// Printable name for a control byte, for logs
pub fn control_name(byte: u8) -> Option<&'static str> {
    Some(match byte {
        STX => "STX",
        ETX => "ETX",
        EOT => "EOT",
        ENQ => "ENQ",
        ACK => "ACK",
        VT => "VT",
        NAK => "NAK",
        ETB => "ETB",
        FS => "FS",
        _ => return None,
    })
}

/// Remove every C0 control character and DEL except CR and LF.
///
/// Idempotent: cleaning a cleaned string changes nothing.
pub fn remove_control_characters(text: &str) -> String {
    text.chars()
        .filter(|&c| c == '\r' || c == '\n' || !(c.is_ascii_control()))
        .collect()
}

/// Map CRLF, LF and CR to one `terminator` and collapse repeats.
pub fn normalize_line_breaks(text: &str, terminator: char) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_break = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' || c == '\n' {
            if c == '\r' && chars.peek() == Some(&'\n') {
                chars.next();
            }
            if !last_was_break {
                out.push(terminator);
            }
            last_was_break = true;
        } else {
            out.push(c);
            last_was_break = false;
        }
    }
    out
}

/// Render bytes with control characters spelled out, e.g. `<STX>1H|<CR>`
pub fn describe_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 8);
    for &b in data {
        match (b, control_name(b)) {
            (_, Some(name)) => {
                out.push('<');
                out.push_str(name);
                out.push('>');
            },
            (CR, None) => out.push_str("<CR>"),
            (LF, None) => out.push_str("<LF>"),
            (b, None) if b.is_ascii_control() => out.push_str(&format!("<{b:02X}>")),
            (b, None) => out.push(b as char),
        }
    }
    out
}
