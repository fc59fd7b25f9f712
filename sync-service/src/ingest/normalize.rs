//! Maps provider payloads onto [`NormalizedRecord`] and converts money to
//! integer minor units.

use crate::models::{CanonicalStatus, NormalizedRecord};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_CURRENCY: &str = "USD";

/// A transaction as the payment API reports it. Unknown fields are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    /// String or number, depending on the provider.
    pub id: Value,
    #[serde(default)]
    pub amount: Value,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Value,
    #[serde(default)]
    pub customer: Option<RawCustomer>,
    #[serde(default, alias = "customer_email")]
    pub customer_email: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCustomer {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record has no usable id")]
    MissingId,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("amount does not fit in minor units: {0}")]
    AmountOverflow(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Normalize one provider record for `source`.
pub fn normalize(source: &str, raw: &RawTransaction) -> Result<NormalizedRecord, NormalizeError> {
    let external_id = match &raw.id {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err(NormalizeError::MissingId),
    };

    let currency = raw
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_ascii_uppercase)
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let amount = decimal_from_json(&raw.amount)
        .ok_or_else(|| NormalizeError::InvalidAmount(raw.amount.to_string()))?;
    let amount_minor = to_minor_units(amount, &currency)
        .ok_or_else(|| NormalizeError::AmountOverflow(amount.to_string()))?;

    let occurred_at = parse_timestamp(&raw.created_at)
        .ok_or_else(|| NormalizeError::InvalidTimestamp(raw.created_at.to_string()))?;

    let customer_email = raw
        .customer
        .as_ref()
        .and_then(|c| c.email.as_deref())
        .or(raw.customer_email.as_deref())
        .and_then(normalize_email);

    let status = raw
        .status
        .as_deref()
        .map(CanonicalStatus::from_external)
        .unwrap_or(CanonicalStatus::Pending);

    Ok(NormalizedRecord {
        source: source.to_string(),
        external_id,
        customer_email,
        amount_minor,
        currency,
        status,
        occurred_at,
        raw_metadata: serde_json::to_value(raw).unwrap_or(Value::Null),
    })
}

/// Number of minor-unit digits for an ISO 4217 code.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "UGX" | "XAF" | "XOF" => 0,
        "KWD" | "BHD" | "OMR" | "JOD" | "TND" | "LYD" | "IQD" => 3,
        _ => 2,
    }
}

/// Convert a major-unit decimal to integer minor units, rounding half away
/// from zero. `None` when the result does not fit in an `i64`.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Option<i64> {
    let factor = Decimal::from(10_i64.checked_pow(currency_exponent(currency))?);
    amount
        .checked_mul(factor)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Read a JSON number or numeric string without going through `f64`.
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => parse_decimal_lenient(s),
        _ => None,
    }
}

/// Parse amounts as they appear in exports: `"$1,234.50"`, `" 12 "`,
/// `"(5.00)"` for negatives.
pub fn parse_decimal_lenient(input: &str) -> Option<Decimal> {
    let trimmed = input.trim();
    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value } else { value })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => {
            let secs = n.as_i64()?;
            // Millisecond epochs are common; anything past year 5138 in
            // seconds is treated as milliseconds.
            if secs > 100_000_000_000 {
                Utc.timestamp_millis_opt(secs).single()
            } else {
                Utc.timestamp_opt(secs, 0).single()
            }
        }
        _ => None,
    }
}

/// Trimmed, lowercased email with exactly one `@` and non-empty parts.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let mut parts = email.split('@');
    let local = parts.next()?;
    let domain = parts.next()?;
    if parts.next().is_some() || local.is_empty() || domain.is_empty() {
        return None;
    }
    if email.chars().any(char::is_whitespace) {
        return None;
    }
    Some(email)
}

/// Digits with an optional leading `+`; at least seven digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{}", digits))
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawTransaction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn normalizes_a_typical_record() {
        let record = normalize(
            "gateway",
            &raw(json!({
                "id": "txn_1",
                "amount": "12.345",
                "currency": "usd",
                "status": "CAPTURED",
                "createdAt": "2024-05-01T10:00:00Z",
                "customer": {"email": "  Ada@Example.COM "},
                "method": "card"
            })),
        )
        .unwrap();

        assert_eq!(record.natural_key(), ("gateway", "txn_1"));
        assert_eq!(record.amount_minor, 1235);
        assert_eq!(record.currency, "USD");
        assert_eq!(record.status, CanonicalStatus::Paid);
        assert_eq!(record.customer_email.as_deref(), Some("ada@example.com"));
        assert_eq!(record.raw_metadata["method"], "card");
    }

    #[test]
    fn numeric_ids_and_epoch_timestamps_are_accepted() {
        let record = normalize(
            "gateway",
            &raw(json!({"id": 991, "amount": 5, "currency": "JPY", "createdAt": 1714557600})),
        )
        .unwrap();
        assert_eq!(record.external_id, "991");
        assert_eq!(record.amount_minor, 5);
        assert_eq!(record.status, CanonicalStatus::Pending);
    }

    #[test]
    fn records_without_id_or_amount_are_rejected() {
        assert_eq!(
            normalize("g", &raw(json!({"id": "", "amount": 1, "createdAt": 0}))),
            Err(NormalizeError::MissingId)
        );
        assert!(matches!(
            normalize("g", &raw(json!({"id": "x", "amount": "n/a", "createdAt": 0}))),
            Err(NormalizeError::InvalidAmount(_))
        ));
    }

    #[test]
    fn minor_units_follow_currency_exponent() {
        let amount = Decimal::from_str("10.5").unwrap();
        assert_eq!(to_minor_units(amount, "USD"), Some(1050));
        assert_eq!(to_minor_units(amount, "JPY"), Some(11));
        assert_eq!(to_minor_units(amount, "KWD"), Some(10500));
        assert_eq!(to_minor_units(Decimal::from_str("-0.005").unwrap(), "EUR"), Some(-1));
    }

    #[test]
    fn lenient_parsing_handles_export_formats() {
        assert_eq!(parse_decimal_lenient("$1,234.50"), Decimal::from_str("1234.50").ok());
        assert_eq!(parse_decimal_lenient("(5.00)"), Decimal::from_str("-5.00").ok());
        assert_eq!(parse_decimal_lenient("  "), None);
        assert_eq!(parse_decimal_lenient("abc"), None);
    }

    #[test]
    fn identity_normalization() {
        assert_eq!(normalize_email(" A@B.io "), Some("a@b.io".to_string()));
        assert_eq!(normalize_email("no-at-sign"), None);
        assert_eq!(normalize_email("a@b@c"), None);
        assert_eq!(normalize_email("@b.io"), None);
        assert_eq!(normalize_phone("+1 (555) 010-9999"), Some("+15550109999".to_string()));
        assert_eq!(normalize_phone("555-01"), None);
    }
}
