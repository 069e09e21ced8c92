//! Outbound order (test request) messages

use chrono::Local;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority of a requested test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPriority {
    #[default]
    Routine,
    Stat,
}

impl OrderPriority {
    fn astm_code(self) -> &'static str {
        match self {
            OrderPriority::Routine => "R",
            OrderPriority::Stat => "S",
        }
    }
}

/// One test to request from an instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub patient_name: String,
    pub test_code: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub specimen_type: String,
    #[serde(default)]
    pub priority: OrderPriority,
}

/// ASTM order message: H, P, O and L records, each CR terminated.
///
/// The result is the frame body; `frame_astm_message` adds framing.
pub fn build_astm_order(order: &OrderRequest, sender: &str) -> String {
    let ts = Local::now().format("%Y%m%d%H%M%S");
    let mut message = String::with_capacity(256);
    message.push_str(&format!("H|\\^&|||{sender}|||||||P|1|{ts}\r"));
    message.push_str(&format!(
        "P|1||{}||{}\r",
        order.patient_id, order.patient_name
    ));
    message.push_str(&format!(
        "O|1|{}||^^^{}|{}||||||A||||{}\r",
        order.order_id,
        order.test_code,
        order.priority.astm_code(),
        order.specimen_type
    ));
    message.push_str("L|1|N\r");
    message
}

/// HL7 OML^O21 order message, CR separated and unwrapped
pub fn build_hl7_order(order: &OrderRequest, sending_app: &str, receiving_app: &str) -> String {
    let ts = Local::now().format("%Y%m%d%H%M%S");
    let control_id: String = Uuid::new_v4().simple().to_string().chars().take(20).collect();
    let priority = match order.priority {
        OrderPriority::Routine => "R",
        OrderPriority::Stat => "S",
    };

    let mut message = String::with_capacity(320);
    message.push_str(&format!(
        "MSH|^~\\&|{sending_app}||{receiving_app}||{ts}||OML^O21^OML_O21|{control_id}|P|2.5.1\r"
    ));
    message.push_str(&format!(
        "PID|1||{}||{}\r",
        order.patient_id, order.patient_name
    ));
    message.push_str(&format!("ORC|NW|{}|||||^^^^^{priority}\r", order.order_id));
    message.push_str(&format!(
        "OBR|1|{}||{}^{}|||{ts}\r",
        order.order_id, order.test_code, order.test_name
    ));
    message.push_str(&format!(
        "SPM|1|{}||{}\r",
        order.order_id, order.specimen_type
    ));
    message
}

#[cfg(test)]
pub(crate) fn sample_order() -> OrderRequest {
    OrderRequest {
        order_id: "ORD-5521".to_string(),
        patient_id: "PAT-77".to_string(),
        patient_name: "DOE^JANE".to_string(),
        test_code: "HIV-VL".to_string(),
        test_name: "HIV Viral Load".to_string(),
        specimen_type: "PLASMA".to_string(),
        priority: OrderPriority::Stat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::hl7::Hl7Message;

    #[test]
    fn test_astm_order_records() {
        let message = build_astm_order(&sample_order(), "LABSRV");
        let records: Vec<&str> = message.split('\r').filter(|r| !r.is_empty()).collect();
        assert_eq!(records.len(), 4);
        assert!(records[0].starts_with("H|\\^&|||LABSRV|"));
        assert_eq!(records[1], "P|1||PAT-77||DOE^JANE");
        let order_fields: Vec<&str> = records[2].split('|').collect();
        assert_eq!(order_fields[2], "ORD-5521");
        assert_eq!(order_fields[4], "^^^HIV-VL");
        assert_eq!(order_fields[5], "S");
        assert_eq!(records[3], "L|1|N");
    }

    #[test]
    fn test_hl7_order_parses() {
        let message = build_hl7_order(&sample_order(), "LABSRV", "ANALYZER");
        let parsed = Hl7Message::parse(&message).unwrap();
        assert_eq!(parsed.message_code(), "OML");
        assert_eq!(parsed.trigger_event(), "O21");
        assert_eq!(parsed.header().unwrap().field(5), "ANALYZER");
        assert!(!parsed.control_id().is_empty());
        assert!(parsed.control_id().len() <= 20);
        let obr = parsed.first("OBR").unwrap();
        assert_eq!(obr.component(4, 1), "HIV-VL");
        assert_eq!(obr.component(4, 2), "HIV Viral Load");
        assert_eq!(parsed.first("SPM").unwrap().field(4), "PLASMA");
    }
}
