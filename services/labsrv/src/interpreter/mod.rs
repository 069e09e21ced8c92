//! Message interpretation
//!
//! A completed transmission is split into sub-messages and each one is
//! handed to the strategy registered for the instrument's machine type.
//! Strategies are registered once at startup in [`InterpreterRegistry`].

pub mod astm;
pub mod hl7;
pub mod normalize;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::{ConnectionParams, NormalizedResult, ProtocolKind};
use crate::error::Result;
use crate::protocols;
use crate::storage::ResultSink;

pub use self::astm::AstmInterpreter;
pub use self::hl7::{Hl7Interpreter, ObxResolution};
pub use self::normalize::format_instrument_timestamp;

/// Machine-type tag of the generic ASTM strategy
pub const ASTM_GENERIC: &str = "astm-generic";
/// Machine-type tag of the generic HL7 strategy
pub const HL7_GENERIC: &str = "hl7-generic";
pub const HL7_SINGLE_SAMPLE: &str = "hl7-single-sample";
pub const HL7_DUAL_CHANNEL: &str = "hl7-dual-channel";
pub const HL7_SAMPLE_METADATA: &str = "hl7-sample-metadata";

/// Fields every interpretation stamps onto its results
#[derive(Debug, Clone)]
pub struct InterpretContext {
    pub machine_id: String,
    pub lab_location: String,
    pub protocol: ProtocolKind,
}

impl From<&ConnectionParams> for InterpretContext {
    fn from(params: &ConnectionParams) -> Self {
        Self {
            machine_id: params.instrument_id.clone(),
            lab_location: params.lab_name.clone(),
            protocol: params.protocol,
        }
    }
}

/// One interpretation strategy
pub trait ResultInterpreter: Send + Sync + fmt::Debug {
    /// Extract results from one cleaned sub-message
    fn interpret(&self, message: &str, ctx: &InterpretContext) -> Result<Vec<NormalizedResult>>;
}

/// Machine-type tag to strategy table
#[derive(Debug, Default)]
pub struct InterpreterRegistry {
    strategies: HashMap<String, Arc<dyn ResultInterpreter>>,
}

impl InterpreterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in machine type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ASTM_GENERIC, Arc::new(AstmInterpreter));
        registry.register(HL7_GENERIC, Arc::new(Hl7Interpreter::new(ObxResolution::PairedIndex)));
        registry.register(
            HL7_SINGLE_SAMPLE,
            Arc::new(Hl7Interpreter::new(ObxResolution::FirstOnly)),
        );
        registry.register(
            HL7_DUAL_CHANNEL,
            Arc::new(Hl7Interpreter::new(ObxResolution::DualChannel)),
        );
        registry.register(
            HL7_SAMPLE_METADATA,
            Arc::new(Hl7Interpreter::new(ObxResolution::SampleMetadata)),
        );
        registry
    }

    pub fn register(&mut self, machine_type: &str, strategy: Arc<dyn ResultInterpreter>) {
        self.strategies
            .insert(machine_type.trim().to_lowercase(), strategy);
    }

    pub fn contains(&self, machine_type: &str) -> bool {
        self.strategies
            .contains_key(&machine_type.trim().to_lowercase())
    }

    pub fn machine_types(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Strategy for `machine_type`; unknown tags get the generic strategy
    /// of the protocol family.
    pub fn resolve(&self, machine_type: &str, protocol: ProtocolKind) -> Option<Arc<dyn ResultInterpreter>> {
        if let Some(strategy) = self.strategies.get(&machine_type.trim().to_lowercase()) {
            return Some(Arc::clone(strategy));
        }
        let fallback = if protocol.is_astm() { ASTM_GENERIC } else { HL7_GENERIC };
        debug!(
            "No strategy for machine type '{}', using {}",
            machine_type, fallback
        );
        self.strategies.get(fallback).cloned()
    }
}

/// Splits transmissions and runs each sub-message through its strategy
#[derive(Debug, Clone)]
pub struct MessageInterpreter {
    registry: Arc<InterpreterRegistry>,
}

impl MessageInterpreter {
    pub fn new(registry: Arc<InterpreterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &InterpreterRegistry {
        &self.registry
    }

    /// Logical sub-messages of one capture, empty fragments dropped
    pub fn split(&self, raw: &str, protocol: ProtocolKind) -> Vec<String> {
        if protocol.is_astm() {
            protocols::astm::split_messages(&protocols::astm::clean_transmission(raw, protocol))
        } else {
            let cleaned = protocols::hl7::unwrap_message(raw);
            protocols::hl7::split_messages(&cleaned)
        }
    }

    /// Interpret every sub-message. A failing sub-message is logged and
    /// skipped; the rest of the batch still yields results.
    pub fn interpret(&self, raw: &str, params: &ConnectionParams) -> Vec<NormalizedResult> {
        let ctx = InterpretContext::from(params);
        let Some(strategy) = self.registry.resolve(&params.machine_type, params.protocol) else {
            warn!(
                "No interpreter for {} ({}), transmission not interpreted",
                params.machine_type, params.protocol
            );
            return Vec::new();
        };

        let mut results = Vec::new();
        for message in self.split(raw, params.protocol) {
            match strategy.interpret(&message, &ctx) {
                Ok(mut extracted) => results.append(&mut extracted),
                Err(e) => {
                    let segments = if params.protocol.is_astm() {
                        astm::describe_segments(&astm::bucket_segments(&message))
                    } else {
                        message.replace('\r', " / ")
                    };
                    warn!(
                        "Interpretation failed for {}: {} (segments: {})",
                        params.instrument_id, e, segments
                    );
                },
            }
        }
        results
    }

    /// Persist the raw capture, then interpret and persist each result.
    ///
    /// Store failures are logged and never retried here. Returns the number
    /// of results stored.
    pub async fn process(&self, sink: &dyn ResultSink, params: &ConnectionParams, raw: &str) -> usize {
        if let Err(e) = sink.record_raw_transmission(&params.instrument_id, raw).await {
            error!("Raw capture from {} not stored: {}", params.instrument_id, e);
        }

        let results = self.interpret(raw, params);
        let mut stored = 0;
        for result in &results {
            match sink.record_result(result).await {
                Ok(()) => stored += 1,
                Err(e) => error!(
                    "Result for order {} from {} not stored: {}",
                    result.order_id, params.instrument_id, e
                ),
            }
        }
        info!(
            "Transmission from {}: {} result(s), {} stored",
            params.instrument_id,
            results.len(),
            stored
        );
        stored
    }
}

impl Default for MessageInterpreter {
    fn default() -> Self {
        Self::new(Arc::new(InterpreterRegistry::with_defaults()))
    }
}
