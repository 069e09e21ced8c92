//! ASTM record interpretation

use std::collections::BTreeMap;
use tracing::{debug, info};

use super::normalize::{self, FAILED};
use super::{InterpretContext, ResultInterpreter};
use crate::core::{NormalizedResult, RESULT_ACCEPTED, RESULT_PENDING};
use crate::error::Result;

/// Record fields keyed by record type (`H`, `P`, `O`, `R`, `C`, `L`, ...)
pub type SegmentMap = BTreeMap<String, Vec<Vec<String>>>;

const FIELD_DELIMITER: char = '|';
const COMPONENT_DELIMITER: char = '^';

// Field positions, counted from the record type at 0
const HEADER_TIMESTAMP: usize = 13;
const PATIENT_ORDER_ID: usize = 5;
const ORDER_SPECIMEN_ID: usize = 2;
const ORDER_INSTRUMENT_SPECIMEN_ID: usize = 3;
const ORDER_TEST: usize = 4;
const RESULT_TEST: usize = 2;
const RESULT_VALUE: usize = 3;
const RESULT_UNITS: usize = 4;
const RESULT_STATUS: usize = 7;
const RESULT_OPERATOR: usize = 8;
const RESULT_STARTED: usize = 9;
const RESULT_COMPLETED: usize = 10;

/// Final result status code
const STATUS_FINAL: &str = "F";

/// Split cleaned message text into records in transmission order, with
/// leading frame digits stripped. Field 0 is the record type.
pub fn parse_records(message: &str) -> Vec<Vec<String>> {
    message
        .split(['\n', '\r'])
        .filter_map(|line| {
            let record = line.trim().trim_start_matches(|c: char| c.is_ascii_digit());
            let mut fields: Vec<String> = record.split(FIELD_DELIMITER).map(str::to_string).collect();
            let kind = fields[0].trim().to_ascii_uppercase();
            if kind.is_empty() {
                return None;
            }
            fields[0] = kind;
            Some(fields)
        })
        .collect()
}

/// Bucket the field arrays by record type
pub fn bucket_segments(message: &str) -> SegmentMap {
    let mut map = SegmentMap::new();
    for fields in parse_records(message) {
        map.entry(fields[0].clone()).or_default().push(fields);
    }
    map
}

/// One order record with the patient above it and its first result
#[derive(Debug)]
struct OrderGroup<'a> {
    patient: Option<&'a [String]>,
    order: &'a [String],
    result: Option<&'a [String]>,
}

/// Walk the record hierarchy: an O belongs to the most recent P, an R to
/// the most recent O. Results before any order are dropped.
fn group_orders(records: &[Vec<String>]) -> Vec<OrderGroup<'_>> {
    let mut groups: Vec<OrderGroup<'_>> = Vec::new();
    let mut patient: Option<&[String]> = None;
    for record in records {
        match record[0].as_str() {
            "P" => patient = Some(record.as_slice()),
            "O" => groups.push(OrderGroup {
                patient,
                order: record.as_slice(),
                result: None,
            }),
            "R" => match groups.last_mut() {
                Some(group) if group.result.is_none() => group.result = Some(record.as_slice()),
                Some(group) => debug!(
                    "Extra result record for order {} ignored",
                    field(group.order, ORDER_SPECIMEN_ID)
                ),
                None => debug!("Result record before any order ignored"),
            },
            _ => {},
        }
    }
    groups
}

fn field(record: &[String], index: usize) -> &str {
    record.get(index).map_or("", |f| f.trim())
}

fn component(record: &[String], index: usize, component: usize) -> &str {
    field(record, index)
        .split(COMPONENT_DELIMITER)
        .nth(component)
        .unwrap_or("")
        .trim()
}

/// Last non-empty component, e.g. `HIV-VL` from `^^^HIV-VL`
fn last_component(record: &[String], index: usize) -> &str {
    field(record, index)
        .rsplit(COMPONENT_DELIMITER)
        .map(str::trim)
        .find(|c| !c.is_empty())
        .unwrap_or("")
}

/// Compact record summary for error logs
pub fn describe_segments(map: &SegmentMap) -> String {
    map.iter()
        .map(|(kind, records)| format!("{kind}x{}", records.len()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Generic ASTM interpretation: one result per order record, taken from the
/// first result record that follows it.
#[derive(Debug, Default)]
pub struct AstmInterpreter;

impl AstmInterpreter {
    fn missing_result(
        &self,
        order: &[String],
        order_id: &str,
        message: &str,
        ctx: &InterpretContext,
    ) -> NormalizedResult {
        NormalizedResult {
            order_id: order_id.to_string(),
            test_id: test_id(order).to_string(),
            test_type: String::new(),
            results: FAILED.to_string(),
            test_unit: String::new(),
            tester_name: String::new(),
            analysed_at: String::new(),
            authorised_at: String::new(),
            accepted_at: String::new(),
            raw_text: message.to_string(),
            result_status: RESULT_PENDING,
            machine_id: ctx.machine_id.clone(),
            lab_location: ctx.lab_location.clone(),
        }
    }
}

fn test_id(order: &[String]) -> &str {
    normalize::first_non_empty(&[
        field(order, ORDER_SPECIMEN_ID),
        field(order, ORDER_INSTRUMENT_SPECIMEN_ID),
    ])
}

impl ResultInterpreter for AstmInterpreter {
    fn interpret(&self, message: &str, ctx: &InterpretContext) -> Result<Vec<NormalizedResult>> {
        let records = parse_records(message);
        let groups = group_orders(&records);
        if groups.is_empty() {
            info!(
                "ASTM message from {} has no order record ({}), skipped",
                ctx.machine_id,
                describe_segments(&bucket_segments(message))
            );
            return Ok(Vec::new());
        }
        let accepted_at = records
            .iter()
            .find(|r| r[0] == "H")
            .map_or("", |h| field(h, HEADER_TIMESTAMP));

        let mut normalized = Vec::with_capacity(groups.len());
        for OrderGroup { patient, order, result } in groups {
            let order_id = normalize::first_non_empty(&[
                patient.map_or("", |p| field(p, PATIENT_ORDER_ID)),
                field(order, ORDER_SPECIMEN_ID),
            ]);

            let Some(result) = result else {
                debug!("Order {} has no result record", order_id);
                normalized.push(self.missing_result(order, order_id, message, ctx));
                continue;
            };

            let outcome = component(result, RESULT_VALUE, 0);
            let titer = outcome == "Titer";
            let numeric = if titer { component(result, RESULT_VALUE, 1) } else { outcome };
            let inline_unit = component(result, RESULT_VALUE, if titer { 2 } else { 1 });
            let units = [
                component(result, RESULT_UNITS, 0),
                component(result, RESULT_UNITS, 1),
                inline_unit,
            ];
            let status = field(result, RESULT_STATUS);
            let class = normalize::classify(status, outcome);
            let value = normalize::resolve_value(class, outcome, numeric, &units);

            let completed = field(result, RESULT_COMPLETED);
            let analysed = normalize::first_non_empty(&[completed, field(result, RESULT_STARTED)]);

            normalized.push(NormalizedResult {
                order_id: order_id.to_string(),
                test_id: test_id(order).to_string(),
                test_type: normalize::first_non_empty(&[
                    last_component(result, RESULT_TEST),
                    last_component(order, ORDER_TEST),
                    last_component(order, ORDER_TEST + 1),
                ])
                .to_string(),
                results: value.value,
                test_unit: value.unit,
                tester_name: field(result, RESULT_OPERATOR).to_string(),
                analysed_at: normalize::format_instrument_timestamp(analysed),
                authorised_at: normalize::format_instrument_timestamp(completed),
                accepted_at: normalize::format_instrument_timestamp(accepted_at),
                raw_text: message.to_string(),
                result_status: if status.eq_ignore_ascii_case(STATUS_FINAL) {
                    RESULT_ACCEPTED
                } else {
                    RESULT_PENDING
                },
                machine_id: ctx.machine_id.clone(),
                lab_location: ctx.lab_location.clone(),
            });
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProtocolKind;

    fn ctx() -> InterpretContext {
        InterpretContext {
            machine_id: "VL-01".to_string(),
            lab_location: "Central Lab".to_string(),
            protocol: ProtocolKind::AstmChecksum,
        }
    }

    #[test]
    fn test_bucket_strips_frame_digits() {
        let map = bucket_segments("1H|\\^&\n2P|1\n3O|1|A\n4O|2|B\n5L|1|N");
        assert_eq!(map["H"].len(), 1);
        assert_eq!(map["O"].len(), 2);
        assert_eq!(map["O"][1][2], "B");
        assert_eq!(parse_records("1H|x\n\n2p|1")[1][0], "P");
        assert_eq!(describe_segments(&map), "Hx1,Lx1,Ox2,Px1");
    }

    #[test]
    fn test_order_result_pairing() {
        let message = "H|\\^&|||LAB|||||||P|1|20240105101500\n\
P|1||||ORD-1\n\
O|1|S1|S1|^^^HIV-VL\n\
R|1|^^^HIV-VL|Titer^4.2E+03^cp/mL||||F|jdoe||20240105100000\n\
O|2|S2|S2|^^^HIV-VL\n\
R|2|^^^HIV-VL|<20||||F\n\
L|1|N";
        let results = AstmInterpreter.interpret(message, &ctx()).unwrap();
        assert_eq!(results.len(), 2);

        let first = &results[0];
        assert_eq!(first.order_id, "ORD-1");
        assert_eq!(first.test_id, "S1");
        assert_eq!(first.test_type, "HIV-VL");
        assert_eq!(first.results, "4.2E+03");
        assert_eq!(first.test_unit, "cp/mL");
        assert_eq!(first.tester_name, "jdoe");
        assert_eq!(first.authorised_at, "2024-01-05 10:00:00");
        assert_eq!(first.accepted_at, "2024-01-05 10:15:00");
        assert!(first.is_accepted());

        assert_eq!(results[1].results, "Target Not Detected");
        assert_eq!(results[1].test_unit, "");
    }

    #[test]
    fn test_missing_result_record_yields_failed() {
        let message = "H|\\^&\nP|1||||ORD-2\nO|1|S9|S9\nL|1|N";
        let results = AstmInterpreter.interpret(message, &ctx()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].results, "Failed");
        assert_eq!(results[0].order_id, "ORD-2");
        assert_eq!(results[0].test_unit, "");
        assert_eq!(results[0].result_status, RESULT_PENDING);
    }

    #[test]
    fn test_result_follows_its_own_order_and_patient() {
        let message = "H|\\^&\nP|1||||ORD-A\nO|1|S1\nP|2||||ORD-B\nO|2|S2\nR|1|^^^VL|999||||F\nL|1|N";
        let results = AstmInterpreter.interpret(message, &ctx()).unwrap();
        assert_eq!(results.len(), 2);

        assert_eq!(results[0].order_id, "ORD-A");
        assert_eq!(results[0].test_id, "S1");
        assert_eq!(results[0].results, "Failed");

        assert_eq!(results[1].order_id, "ORD-B");
        assert_eq!(results[1].test_id, "S2");
        assert_eq!(results[1].results, "999");
        assert!(results[1].is_accepted());
    }

    #[test]
    fn test_extra_and_orphan_results_ignored() {
        let message = "H|\\^&\nR|0|^^^VL|1||||F\nP|1||||ORD-C\nO|1|S1\nR|1|^^^VL|10||||F\nR|2|^^^VL|20||||F\nL|1|N";
        let results = AstmInterpreter.interpret(message, &ctx()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].results, "10");
    }

    #[test]
    fn test_no_order_record_is_not_an_error() {
        let results = AstmInterpreter
            .interpret("H|\\^&\nP|1\nL|1|N", &ctx())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_status_codes() {
        let base = "H|\\^&\nP|1||||ORD-3\nO|1|S3\n";
        let pending = AstmInterpreter
            .interpret(&format!("{base}R|1|^^^VL|500||||P"), &ctx())
            .unwrap();
        assert_eq!(pending[0].result_status, RESULT_PENDING);
        assert_eq!(pending[0].results, "500");

        let error = AstmInterpreter
            .interpret(&format!("{base}R|1|^^^VL|500||||X"), &ctx())
            .unwrap();
        assert_eq!(error[0].results, "Failed");

        let incomplete = AstmInterpreter
            .interpret(&format!("{base}R|1|^^^VL|500||||I"), &ctx())
            .unwrap();
        assert_eq!(incomplete[0].results, "Incomplete");
    }
}
