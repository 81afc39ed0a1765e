//! Mapping of raw external JSON payloads into typed local records.
//!
//! The source API returns objects with display-style field names
//! ("Amount", "Issuer Bank", "EPP Month"). Required fields fail the map
//! with a typed error; optional fields degrade to `None`.

use chrono::{DateTime, Utc};
use paybridge_core::{ExternalId, PaymentRecord};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "paybridge-records";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {field} is not a {expected}")]
    InvalidType {
        field: &'static str,
        expected: &'static str,
    },
}

/// Map one payment payload. The payload's own `_id` wins when present so
/// a record fetched through an alias id still lands on its canonical key.
pub fn map_payment(id: &ExternalId, payload: &JsonValue) -> Result<PaymentRecord, MapError> {
    let obj = payload.as_object().ok_or(MapError::NotAnObject)?;

    let bubble_id = match obj.get("_id") {
        Some(value) => ExternalId::new(as_str(value, "_id")?),
        None => id.clone(),
    };

    Ok(PaymentRecord {
        bubble_id,
        amount: require_f64(obj, "Amount")?,
        issuer_bank: opt_str(obj, "Issuer Bank")?,
        epp_type: opt_str(obj, "EPP Type")?,
        epp_month: opt_i32(obj, "EPP Month")?,
        epp_cost: opt_f64(obj, "EPP Cost")?,
        invoice_bubble_id: opt_str(obj, "Invoice")?.map(ExternalId::new),
        agent_bubble_id: opt_str(obj, "Agent")?.map(ExternalId::new),
        paid_at: opt_datetime(obj, "Paid Date")?,
    })
}

/// Pull the `_id` out of each listing-page object, skipping malformed
/// entries.
pub fn extract_ids(results: &[JsonValue]) -> Vec<ExternalId> {
    results
        .iter()
        .filter_map(|value| value.get("_id"))
        .filter_map(|id| id.as_str())
        .map(ExternalId::from)
        .collect()
}

type JsonObject = serde_json::Map<String, JsonValue>;

fn as_str(value: &JsonValue, field: &'static str) -> Result<String, MapError> {
    value
        .as_str()
        .map(ToString::to_string)
        .ok_or(MapError::InvalidType {
            field,
            expected: "string",
        })
}

fn require_f64(obj: &JsonObject, field: &'static str) -> Result<f64, MapError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Err(MapError::MissingField(field)),
        Some(value) => value.as_f64().ok_or(MapError::InvalidType {
            field,
            expected: "number",
        }),
    }
}

fn opt_f64(obj: &JsonObject, field: &'static str) -> Result<Option<f64>, MapError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or(MapError::InvalidType {
            field,
            expected: "number",
        }),
    }
}

fn opt_i32(obj: &JsonObject, field: &'static str) -> Result<Option<i32>, MapError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(|v| v as i32)
            .map(Some)
            .ok_or(MapError::InvalidType {
                field,
                expected: "integer",
            }),
    }
}

fn opt_str(obj: &JsonObject, field: &'static str) -> Result<Option<String>, MapError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => as_str(value, field).map(Some),
    }
}

fn opt_datetime(obj: &JsonObject, field: &'static str) -> Result<Option<DateTime<Utc>>, MapError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => {
            let raw = value.as_str().ok_or(MapError::InvalidType {
                field,
                expected: "RFC 3339 timestamp",
            })?;
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|_| MapError::InvalidType {
                    field,
                    expected: "RFC 3339 timestamp",
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_full_payment_payload() {
        let payload = json!({
            "_id": "pay-42",
            "Amount": 1500.5,
            "Issuer Bank": "Maybank",
            "EPP Type": "EPP",
            "EPP Month": 12,
            "EPP Cost": 60.02,
            "Invoice": "inv-7",
            "Agent": "agent-3",
            "Paid Date": "2026-01-15T08:30:00Z"
        });

        let record = map_payment(&ExternalId::from("pay-42"), &payload).expect("map");
        assert_eq!(record.bubble_id, ExternalId::from("pay-42"));
        assert_eq!(record.amount, 1500.5);
        assert_eq!(record.issuer_bank.as_deref(), Some("Maybank"));
        assert_eq!(record.epp_month, Some(12));
        assert_eq!(record.epp_cost, Some(60.02));
        assert_eq!(record.invoice_bubble_id, Some(ExternalId::from("inv-7")));
        assert_eq!(record.agent_bubble_id, Some(ExternalId::from("agent-3")));
        assert!(record.paid_at.is_some());
    }

    #[test]
    fn sparse_payload_maps_optionals_to_none() {
        let payload = json!({ "_id": "pay-1", "Amount": 100.0 });
        let record = map_payment(&ExternalId::from("pay-1"), &payload).expect("map");
        assert_eq!(record.issuer_bank, None);
        assert_eq!(record.epp_type, None);
        assert_eq!(record.epp_month, None);
        assert_eq!(record.epp_cost, None);
        assert_eq!(record.invoice_bubble_id, None);
        assert_eq!(record.paid_at, None);
    }

    #[test]
    fn missing_amount_is_a_map_error() {
        let payload = json!({ "_id": "pay-1", "Issuer Bank": "CIMB" });
        let err = map_payment(&ExternalId::from("pay-1"), &payload).expect_err("must fail");
        assert_eq!(err, MapError::MissingField("Amount"));
    }

    #[test]
    fn mistyped_fields_are_invalid_type() {
        let payload = json!({ "_id": "pay-1", "Amount": "not-a-number" });
        let err = map_payment(&ExternalId::from("pay-1"), &payload).expect_err("must fail");
        assert_eq!(
            err,
            MapError::InvalidType { field: "Amount", expected: "number" }
        );

        let payload = json!({ "_id": "pay-1", "Amount": 10.0, "Paid Date": "yesterday" });
        let err = map_payment(&ExternalId::from("pay-1"), &payload).expect_err("must fail");
        assert_eq!(
            err,
            MapError::InvalidType { field: "Paid Date", expected: "RFC 3339 timestamp" }
        );
    }

    #[test]
    fn payload_id_wins_over_requested_id() {
        let payload = json!({ "_id": "canonical", "Amount": 1.0 });
        let record = map_payment(&ExternalId::from("alias"), &payload).expect("map");
        assert_eq!(record.bubble_id, ExternalId::from("canonical"));

        let payload = json!({ "Amount": 1.0 });
        let record = map_payment(&ExternalId::from("alias"), &payload).expect("map");
        assert_eq!(record.bubble_id, ExternalId::from("alias"));
    }

    #[test]
    fn extract_ids_skips_malformed_rows() {
        let results = vec![
            json!({ "_id": "a" }),
            json!({ "name": "no id" }),
            json!({ "_id": 42 }),
            json!({ "_id": "b" }),
        ];
        assert_eq!(
            extract_ids(&results),
            vec![ExternalId::from("a"), ExternalId::from("b")]
        );
    }
}
