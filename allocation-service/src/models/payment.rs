//! Incoming payment model.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A bank credit handed over by the bank-feed ingestion service.
///
/// `id` is the stable external key of the credit and doubles as the
/// idempotency key of the matching run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct IncomingPayment {
    #[validate(length(min = 1, message = "payment id is required"))]
    pub id: String,
    #[validate(length(min = 1, message = "tenant id is required"))]
    pub tenant_id: String,
    #[validate(length(min = 1, message = "contact id must not be empty"))]
    pub contact_id: Option<String>,
    #[validate(range(min = 1, message = "amount must be a positive number of minor units"))]
    pub amount_minor_units: i64,
    #[serde(default)]
    pub payee_name_raw: String,
    #[serde(default)]
    pub description_raw: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub external_reference: Option<String>,
}
