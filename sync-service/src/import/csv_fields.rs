//! Column recognition for uploaded CSV files.
//!
//! Headers are matched case-insensitively with spaces and dashes read as
//! underscores, so `E-Mail Address` and `email_address` are the same column.

use crate::ingest::normalize::{normalize_email, normalize_phone};
use std::collections::BTreeMap;

const EMAIL_KEYS: &[&str] = &["email", "e_mail", "email_address", "customer_email"];
const PHONE_KEYS: &[&str] = &["phone", "phone_number", "mobile", "contact", "telephone"];
const NAME_KEYS: &[&str] = &["name", "full_name", "customer_name"];
const CURRENCY_KEYS: &[&str] = &["currency"];
const STATUS_KEYS: &[&str] = &["status"];
const TAG_KEYS: &[&str] = &["tags", "labels"];

/// Layout of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvSourceType {
    Customers,
    Transactions,
    Generic,
}

impl CsvSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Transactions => "transactions",
            Self::Generic => "generic",
        }
    }

    /// Unknown or missing types fall back to `generic`.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("customers") | Some("customer") => Self::Customers,
            Some("transactions") | Some("transaction") => Self::Transactions,
            _ => Self::Generic,
        }
    }

    fn amount_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Customers => &["total_spent", "lifetime_value"],
            Self::Transactions => &["amount", "total"],
            Self::Generic => &["amount", "total", "total_spent"],
        }
    }

    fn has_status(&self) -> bool {
        !matches!(self, Self::Customers)
    }
}

/// `Customer E-Mail` -> `customer_e_mail`.
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Best-effort identity columns pulled from a raw row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
}

impl Identity {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }
}

/// Aggregate columns read by the merge worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowAggregates {
    pub amount: Option<String>,
    pub status: Option<String>,
    pub currency: Option<String>,
    pub tags: Vec<String>,
}

/// A row keyed by normalized header.
pub struct RowView<'a> {
    data: &'a BTreeMap<String, String>,
}

impl<'a> RowView<'a> {
    pub fn new(data: &'a BTreeMap<String, String>) -> Self {
        Self { data }
    }

    /// First non-blank value among `keys`.
    fn first(&self, keys: &[&str]) -> Option<&'a str> {
        keys.iter()
            .filter_map(|k| self.data.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }

    pub fn identity(&self) -> Identity {
        let email = self.first(EMAIL_KEYS).and_then(normalize_email);
        let phone = self.first(PHONE_KEYS).and_then(normalize_phone);
        let full_name = self.first(NAME_KEYS).map(str::to_string).or_else(|| {
            let parts: Vec<&str> = [self.first(&["first_name"]), self.first(&["last_name"])]
                .into_iter()
                .flatten()
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        });
        Identity {
            email,
            phone,
            full_name,
        }
    }

    pub fn aggregates(&self, source_type: CsvSourceType) -> RowAggregates {
        RowAggregates {
            amount: self.first(source_type.amount_keys()).map(str::to_string),
            status: if source_type.has_status() {
                self.first(STATUS_KEYS).map(str::to_string)
            } else {
                None
            },
            currency: self.first(CURRENCY_KEYS).map(|c| c.to_ascii_uppercase()),
            tags: self.first(TAG_KEYS).map(split_tags).unwrap_or_default(),
        }
    }
}

/// Split on `,`, `;` or `|`, trimming and dropping blanks.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split([',', ';', '|'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
