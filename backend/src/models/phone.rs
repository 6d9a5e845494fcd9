//! Subscriber phone numbers in canonical `254XXXXXXXXX` form

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LedgerError;

const COUNTRY_CODE: &str = "254";
const SUBSCRIBER_DIGITS: usize = 9;

/// A validated, normalised phone number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Accepts `+254`, `254`, `0` or no prefix before a nine-digit subscriber
    /// number whose first digit is 1-9. Whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

        let subscriber = compact
            .strip_prefix('+')
            .and_then(|rest| rest.strip_prefix(COUNTRY_CODE))
            .or_else(|| {
                (compact.len() == COUNTRY_CODE.len() + SUBSCRIBER_DIGITS)
                    .then(|| compact.strip_prefix(COUNTRY_CODE))
                    .flatten()
            })
            .or_else(|| {
                (compact.len() == SUBSCRIBER_DIGITS + 1)
                    .then(|| compact.strip_prefix('0'))
                    .flatten()
            })
            .unwrap_or(&compact);

        let valid = subscriber.len() == SUBSCRIBER_DIGITS
            && subscriber.chars().all(|c| c.is_ascii_digit())
            && !subscriber.starts_with('0');

        if !valid {
            return Err(LedgerError::Validation(format!(
                "Invalid phone number: '{}'",
                raw
            )));
        }

        Ok(PhoneNumber(format!("{}{}", COUNTRY_CODE, subscriber)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PhoneNumber::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(phone: PhoneNumber) -> Self {
        phone.0
    }
}
