use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Canonical customer, keyed by email, or by phone when no email is known.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub currency: Option<String>,
    pub total_spent_minor: i64,
    pub payment_count: i64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accumulated from one identity group of staged rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedCustomer {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub currency: Option<String>,
    pub total_spent_minor: i64,
    pub payment_count: i64,
    pub tags: Vec<String>,
}

impl MergedCustomer {
    /// Fold this group into an existing entity (or create one).
    ///
    /// Existing non-null scalars win, totals add and tags are unioned.
    pub fn apply_to(&self, existing: Option<&Customer>, now: DateTime<Utc>) -> Customer {
        match existing {
            Some(current) => {
                let mut tags = current.tags.clone();
                tags.extend(self.tags.iter().cloned());
                tags.sort();
                tags.dedup();

                Customer {
                    id: current.id,
                    email: current.email.clone().or_else(|| self.email.clone()),
                    phone: current.phone.clone().or_else(|| self.phone.clone()),
                    full_name: current.full_name.clone().or_else(|| self.full_name.clone()),
                    currency: current.currency.clone().or_else(|| self.currency.clone()),
                    total_spent_minor: current
                        .total_spent_minor
                        .saturating_add(self.total_spent_minor),
                    payment_count: current.payment_count + self.payment_count,
                    tags,
                    created_at: current.created_at,
                    updated_at: now,
                }
            }
            None => Customer {
                id: Uuid::new_v4(),
                email: self.email.clone(),
                phone: self.phone.clone(),
                full_name: self.full_name.clone(),
                currency: self.currency.clone(),
                total_spent_minor: self.total_spent_minor,
                payment_count: self.payment_count,
                tags: self.tags.clone(),
                created_at: now,
                updated_at: now,
            },
        }
    }
}
