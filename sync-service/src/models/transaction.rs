use chrono::{DateTime, Utc};
use serde::Serialize;

/// Status vocabulary shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalStatus {
    Paid,
    Failed,
    Pending,
    Refunded,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Pending => "pending",
            Self::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            "refunded" => Self::Refunded,
            _ => Self::Pending,
        }
    }

    /// Map a provider status string onto the canonical set.
    ///
    /// Unrecognized values are treated as pending.
    pub fn from_external(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "SUCCESS" | "SUCCEEDED" | "SUCCESSFUL" | "CAPTURED" | "PAID" | "SETTLED"
            | "APPROVED" | "COMPLETED" | "COMPLETE" => Self::Paid,
            "FAILED" | "FAILURE" | "DECLINED" | "REJECTED" | "ERROR" | "CANCELLED"
            | "CANCELED" | "EXPIRED" | "VOIDED" => Self::Failed,
            "REFUNDED" | "PARTIALLY_REFUNDED" | "REFUND" | "CHARGEBACK" | "REVERSED" => {
                Self::Refunded
            }
            _ => Self::Pending,
        }
    }
}

/// A transaction in canonical shape, identified by `(source, external_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub source: String,
    pub external_id: String,
    pub customer_email: Option<String>,
    /// Integer minor units (cents, paise, ...).
    pub amount_minor: i64,
    pub currency: String,
    pub status: CanonicalStatus,
    pub occurred_at: DateTime<Utc>,
    pub raw_metadata: serde_json::Value,
}

impl NormalizedRecord {
    pub fn natural_key(&self) -> (&str, &str) {
        (&self.source, &self.external_id)
    }
}

/// Rows written by one upsert statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_statuses_map_to_canonical_set() {
        assert_eq!(CanonicalStatus::from_external("captured"), CanonicalStatus::Paid);
        assert_eq!(CanonicalStatus::from_external(" Succeeded "), CanonicalStatus::Paid);
        assert_eq!(CanonicalStatus::from_external("declined"), CanonicalStatus::Failed);
        assert_eq!(
            CanonicalStatus::from_external("partially-refunded"),
            CanonicalStatus::Refunded
        );
        assert_eq!(CanonicalStatus::from_external("authorized"), CanonicalStatus::Pending);
        assert_eq!(CanonicalStatus::from_external(""), CanonicalStatus::Pending);
    }

    #[test]
    fn status_string_round_trips_through_storage_form() {
        for status in [
            CanonicalStatus::Paid,
            CanonicalStatus::Failed,
            CanonicalStatus::Pending,
            CanonicalStatus::Refunded,
        ] {
            assert_eq!(CanonicalStatus::from_str(status.as_str()), status);
        }
    }
}
