//! Carrier callback and request models

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::MAX_AMOUNT;

const LOAN_REFERENCE_PREFIX: &str = "LOAN-";

/// Account reference that routes a carrier payment to one loan
pub fn loan_reference(loan_id: Uuid) -> String {
    format!("{}{}", LOAN_REFERENCE_PREFIX, loan_id)
}

/// Extracts the loan id from a `LOAN-<uuid>` account reference
pub fn parse_loan_reference(reference: &str) -> Option<Uuid> {
    let trimmed = reference.trim();
    let id = trimmed
        .get(..LOAN_REFERENCE_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(LOAN_REFERENCE_PREFIX))
        .map(|_| &trimmed[LOAN_REFERENCE_PREFIX.len()..])?;
    Uuid::parse_str(id).ok()
}

/// C2B confirmation callback body
#[derive(Debug, Clone, Deserialize)]
pub struct C2bConfirmation {
    #[serde(rename = "TransID")]
    pub trans_id: String,
    #[serde(rename = "TransAmount", alias = "Amount", deserialize_with = "whole_amount")]
    pub amount: i64,
    #[serde(rename = "MSISDN")]
    pub msisdn: String,
    #[serde(rename = "BillRefNumber", default)]
    pub bill_ref_number: Option<String>,
    #[serde(rename = "TransTime", default)]
    pub trans_time: Option<String>,
    #[serde(rename = "FirstName", default)]
    pub first_name: Option<String>,
}

impl C2bConfirmation {
    pub fn target_loan(&self) -> Option<Uuid> {
        self.bill_ref_number.as_deref().and_then(parse_loan_reference)
    }
}

/// The carrier sends amounts either as numbers or as strings like "1000.00".
/// Anything that does not round to a whole amount within
/// [`MAX_AMOUNT`] is rejected.
fn whole_amount<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    let amount = match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Some(v),
        Raw::Float(v) => round_amount(v),
        Raw::Text(s) => {
            let text = s.trim();
            match text.parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => text
                    .parse::<f64>()
                    .map_err(|_| serde::de::Error::custom(format!("invalid amount '{}'", s)))
                    .map(round_amount)?,
            }
        }
    };

    amount
        .filter(|v| v.abs() <= MAX_AMOUNT)
        .ok_or_else(|| serde::de::Error::custom("amount out of range"))
}

fn round_amount(value: f64) -> Option<i64> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded.abs() > MAX_AMOUNT as f64 {
        return None;
    }
    Some(rounded as i64)
}

/// Acknowledgement the carrier expects from a callback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct C2bAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl C2bAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted".to_string(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            result_code: 1,
            result_desc: reason.into(),
        }
    }
}

/// Carrier acknowledgement of a collection or disbursement request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayReceipt {
    /// Checkout or conversation id used to query the request later
    pub request_id: String,
    pub response_code: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
}

/// Request to prompt a borrower for a loan repayment
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StkPushRequest {
    pub loan_id: Uuid,
    /// Defaults to the loan's remaining balance
    #[validate(range(min = 1, max = 1000000000000))]
    pub amount: Option<i64>,
}

/// Request to record an incoming payment
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IncomingTransactionRequest {
    #[validate(length(min = 9, max = 16))]
    pub phone: String,
    #[validate(range(min = 1, max = 1000000000000))]
    pub amount: i64,
    pub source_phone: Option<String>,
    #[validate(length(max = 255))]
    pub description: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub reference: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_loan_reference_roundtrip_and_rejects() {
        let id = Uuid::new_v4();
        assert_eq!(parse_loan_reference(&loan_reference(id)), Some(id));
        assert_eq!(parse_loan_reference(&format!(" loan-{} ", id)), Some(id));
        assert_eq!(parse_loan_reference("INV-42"), None);
        assert_eq!(parse_loan_reference("LOAN-not-a-uuid"), None);
        assert_eq!(parse_loan_reference(""), None);
    }

    #[test]
    fn test_confirmation_accepts_string_and_numeric_amounts() {
        let loan_id = Uuid::new_v4();
        let conf: C2bConfirmation = serde_json::from_value(json!({
            "TransID": "QK7X1ABC",
            "TransAmount": "1000.00",
            "MSISDN": "254712345678",
            "BillRefNumber": format!("LOAN-{}", loan_id)
        }))
        .unwrap();
        assert_eq!(conf.amount, 1000);
        assert_eq!(conf.target_loan(), Some(loan_id));

        let legacy: C2bConfirmation = serde_json::from_value(json!({
            "TransID": "QK7X1ABD",
            "Amount": 250,
            "MSISDN": "0712345678"
        }))
        .unwrap();
        assert_eq!(legacy.amount, 250);
        assert_eq!(legacy.target_loan(), None);
    }

    #[test]
    fn test_confirmation_rejects_out_of_range_amounts() {
        for amount in [json!("1e30"), json!(1e30), json!(i64::MAX), json!("NaN")] {
            let parsed = serde_json::from_value::<C2bConfirmation>(json!({
                "TransID": "QK7X1ABE",
                "TransAmount": amount.clone(),
                "MSISDN": "254712345678"
            }));
            assert!(parsed.is_err(), "{} should be rejected", amount);
        }

        // Integer strings parse without a float round trip
        let exact: C2bConfirmation = serde_json::from_value(json!({
            "TransID": "QK7X1ABF",
            "TransAmount": "999999999999",
            "MSISDN": "254712345678"
        }))
        .unwrap();
        assert_eq!(exact.amount, 999_999_999_999);
    }

    #[test]
    fn test_ack_shape() {
        let ack = serde_json::to_value(C2bAck::accepted()).unwrap();
        assert_eq!(ack, json!({ "ResultCode": 0, "ResultDesc": "Accepted" }));
        assert_eq!(C2bAck::rejected("Unknown subscriber").result_code, 1);
    }
}
