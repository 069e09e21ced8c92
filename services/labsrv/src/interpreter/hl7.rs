//! HL7 OBX interpretation with per-machine-type sample resolution

use tracing::warn;

use super::normalize::{self, ResultClass};
use super::{InterpretContext, ResultInterpreter};
use crate::core::{NormalizedResult, RESULT_ACCEPTED, RESULT_PENDING};
use crate::error::{LabSrvError, Result};
use crate::protocols::hl7::{Hl7Message, Segment};

/// How the OBX belonging to an SPM sample number is located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObxResolution {
    /// Two OBX per sample, the quantitative one at `(n - 1) * 2 + 1`
    PairedIndex,
    /// Single-sample platforms: always the first OBX
    FirstOnly,
    /// Dual-channel platforms: the OBX whose OBX-4 is `1/2`
    DualChannel,
    /// OBX-4 carries the sample number
    SampleMetadata,
}

impl ObxResolution {
    /// Locate the OBX for `sample_number` (1-based).
    ///
    /// On a miss this falls back to the first OBX with a warning, which can
    /// attach another sample's value to this one.
    pub fn resolve<'a>(&self, observations: &[&'a Segment], sample_number: usize) -> Option<&'a Segment> {
        let found = match self {
            ObxResolution::PairedIndex => sample_number
                .checked_sub(1)
                .and_then(|n| observations.get(n * 2 + 1))
                .copied(),
            ObxResolution::FirstOnly => observations.first().copied(),
            ObxResolution::DualChannel => observations
                .iter()
                .find(|obx| obx.field(4).trim() == "1/2")
                .copied(),
            ObxResolution::SampleMetadata => {
                let wanted = sample_number.to_string();
                observations
                    .iter()
                    .find(|obx| obx.field(4).trim() == wanted)
                    .copied()
            },
        };
        if found.is_none() && !observations.is_empty() {
            warn!(
                "No OBX matched sample {} ({:?}), falling back to first OBX",
                sample_number, self
            );
        }
        found.or_else(|| observations.first().copied())
    }
}

/// HL7 ORU interpretation, one result per SPM sample
#[derive(Debug)]
pub struct Hl7Interpreter {
    resolution: ObxResolution,
}

impl Hl7Interpreter {
    pub fn new(resolution: ObxResolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> ObxResolution {
        self.resolution
    }
}

fn order_id_for(message: &Hl7Message, specimen: Option<&Segment>) -> String {
    let obr = message.first("OBR");
    normalize::first_non_empty(&[
        specimen.map_or("", |spm| spm.component(2, 1)),
        specimen.map_or("", |spm| spm.component(2, 2)),
        obr.map_or("", |o| o.component(3, 1)),
        obr.map_or("", |o| o.component(2, 1)),
    ])
    .to_string()
}

impl ResultInterpreter for Hl7Interpreter {
    fn interpret(&self, message: &str, ctx: &InterpretContext) -> Result<Vec<NormalizedResult>> {
        let parsed = Hl7Message::parse(message)?;
        let observations: Vec<&Segment> = parsed.segments_named("OBX").collect();
        if observations.is_empty() {
            return Err(LabSrvError::missing_segment("OBX"));
        }

        // Without SPM the whole message is one sample
        let specimens: Vec<Option<&Segment>> = {
            let spm: Vec<Option<&Segment>> = parsed.segments_named("SPM").map(Some).collect();
            if spm.is_empty() { vec![None] } else { spm }
        };

        let accepted_at = parsed.header().map_or("", |msh| msh.field(7));
        let mut results = Vec::with_capacity(specimens.len());
        for (i, specimen) in specimens.iter().enumerate() {
            let sample_number = specimen
                .and_then(|spm| spm.field(1).trim().parse::<usize>().ok())
                .unwrap_or(i + 1);
            let Some(obx) = self.resolution.resolve(&observations, sample_number) else {
                continue;
            };

            let outcome = obx.component(5, 1).trim();
            let numeric = if outcome == "Titer" {
                obx.component(5, 2)
            } else {
                outcome
            };
            let units = [obx.component(6, 1), obx.component(6, 2), obx.component(6, 3)];
            let class = normalize::classify(obx.field(11), outcome);
            let value = normalize::resolve_value(class, outcome, numeric, &units);

            let observed = obx.field(14);
            let analysed = normalize::first_non_empty(&[obx.field(19), observed]);
            results.push(NormalizedResult {
                order_id: order_id_for(&parsed, *specimen),
                test_id: obx.component(3, 1).trim().to_string(),
                test_type: normalize::first_non_empty(&[obx.component(3, 2), obx.component(3, 1)])
                    .to_string(),
                results: value.value,
                test_unit: value.unit,
                tester_name: normalize::first_non_empty(&[obx.component(16, 2), obx.component(16, 1)])
                    .to_string(),
                analysed_at: normalize::format_instrument_timestamp(analysed),
                authorised_at: normalize::format_instrument_timestamp(observed),
                accepted_at: normalize::format_instrument_timestamp(accepted_at),
                raw_text: message.to_string(),
                result_status: if class == ResultClass::Final {
                    RESULT_ACCEPTED
                } else {
                    RESULT_PENDING
                },
                machine_id: ctx.machine_id.clone(),
                lab_location: ctx.lab_location.clone(),
            });
        }
        Ok(results)
    }
}
