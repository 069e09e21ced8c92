//! Wire protocols spoken by lab instruments
//!
//! - `control`: link-control bytes and text cleaning
//! - `astm`: checksums, outbound framing, sequence numbers
//! - `hl7`: HL7 v2 object model and MLLP envelopes
//! - `framer`: inbound reassembly and link-level replies
//! - `orders`: outbound test requests

pub mod astm;
pub mod control;
pub mod framer;
pub mod hl7;
pub mod orders;

pub use astm::{SequenceRegistry, checksum, frame_astm_message};
pub use framer::{FramerOutput, ProtocolFramer};
pub use hl7::{AckCode, Hl7Message};
pub use orders::{OrderPriority, OrderRequest, build_astm_order, build_hl7_order};
