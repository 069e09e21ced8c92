//! Connection parameters and identity keys

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LabSrvError, Result};

/// Which side opens the TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// We listen, the instrument dials in
    Listen,
    /// We dial the instrument
    Dial,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Listen => "listen",
            TransportMode::Dial => "dial",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = LabSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "listen" | "server" => Ok(TransportMode::Listen),
            "dial" | "client" => Ok(TransportMode::Dial),
            other => Err(LabSrvError::config(format!("Unknown transport mode: {other}"))),
        }
    }
}

/// Line protocol spoken by the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// ASTM with STX/ETX frames carrying checksums
    #[serde(rename = "astm-checksum")]
    AstmChecksum,
    /// ASTM records without frame checksums
    #[serde(rename = "astm-nonchecksum")]
    AstmNonChecksum,
    /// HL7 v2 in MLLP (VT ... FS CR) envelopes
    #[serde(rename = "hl7")]
    Hl7,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::AstmChecksum => "astm-checksum",
            ProtocolKind::AstmNonChecksum => "astm-nonchecksum",
            ProtocolKind::Hl7 => "hl7",
        }
    }

    pub fn is_astm(&self) -> bool {
        matches!(self, ProtocolKind::AstmChecksum | ProtocolKind::AstmNonChecksum)
    }

    /// Whether a keepalive must be answered by the peer.
    ///
    /// ASTM peers answer ENQ with ACK/NAK; an HL7 ACK envelope gets no reply.
    pub fn expects_keepalive_reply(&self) -> bool {
        self.is_astm()
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = LabSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "astm-checksum" | "astm" => Ok(ProtocolKind::AstmChecksum),
            "astm-nonchecksum" => Ok(ProtocolKind::AstmNonChecksum),
            "hl7" => Ok(ProtocolKind::Hl7),
            other => Err(LabSrvError::config(format!("Unknown protocol: {other}"))),
        }
    }
}

/// Input for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub mode: TransportMode,
    pub protocol: ProtocolKind,
    pub host: String,
    pub port: u16,
    /// Instrument identifier, also the machine id on stored results
    pub instrument_id: String,
    /// Tag selecting the interpretation strategy
    pub machine_type: String,
    pub lab_name: String,
    pub auto_reconnect: bool,
}

impl ConnectionParams {
    /// Identity key `host:port:mode:protocol`
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey(format!(
            "{}:{}:{}:{}",
            self.host, self.port, self.mode, self.protocol
        ))
    }

    /// Address used for bind/connect
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Refuse attempts that could never open a socket
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LabSrvError::config(format!(
                "Instrument {} has no host",
                self.instrument_id
            )));
        }
        if self.port == 0 {
            return Err(LabSrvError::config(format!(
                "Instrument {} has no port",
                self.instrument_id
            )));
        }
        Ok(())
    }
}

/// Unique handle for one logical instrument connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
pub(crate) fn sample_params(mode: TransportMode, protocol: ProtocolKind) -> ConnectionParams {
    ConnectionParams {
        mode,
        protocol,
        host: "127.0.0.1".to_string(),
        port: 5100,
        instrument_id: "VL-01".to_string(),
        machine_type: "astm-generic".to_string(),
        lab_name: "Central Lab".to_string(),
        auto_reconnect: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_format() {
        let params = sample_params(TransportMode::Dial, ProtocolKind::AstmChecksum);
        assert_eq!(params.key().as_str(), "127.0.0.1:5100:dial:astm-checksum");

        let hl7 = sample_params(TransportMode::Listen, ProtocolKind::Hl7);
        assert_eq!(hl7.key().as_str(), "127.0.0.1:5100:listen:hl7");
        assert_ne!(params.key(), hl7.key());
    }

    #[test]
    fn test_validate_rejects_missing_host_and_port() {
        let mut params = sample_params(TransportMode::Dial, ProtocolKind::Hl7);
        params.host = "  ".to_string();
        assert!(matches!(params.validate(), Err(LabSrvError::ConfigError(_))));

        let mut params = sample_params(TransportMode::Dial, ProtocolKind::Hl7);
        params.port = 0;
        assert!(matches!(params.validate(), Err(LabSrvError::ConfigError(_))));
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!("LISTEN".parse::<TransportMode>().unwrap(), TransportMode::Listen);
        assert_eq!("client".parse::<TransportMode>().unwrap(), TransportMode::Dial);
        assert_eq!(
            "astm-nonchecksum".parse::<ProtocolKind>().unwrap(),
            ProtocolKind::AstmNonChecksum
        );
        assert!("modbus".parse::<ProtocolKind>().is_err());
        let json = serde_json::to_string(&ProtocolKind::AstmChecksum).unwrap();
        assert_eq!(json, "\"astm-checksum\"");
    }
}
