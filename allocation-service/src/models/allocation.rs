//! Allocation and credit balance models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an invoice set was identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Reference,
    ExactAmountName,
    PartialMulti,
    FuzzyName,
    /// Allocation funded from a contact's credit balance. Never a candidate.
    CreditBalance,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Reference => "reference",
            MatchType::ExactAmountName => "exact_amount_name",
            MatchType::PartialMulti => "partial_multi",
            MatchType::FuzzyName => "fuzzy_name",
            MatchType::CreditBalance => "credit_balance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reference" => Some(MatchType::Reference),
            "exact_amount_name" => Some(MatchType::ExactAmountName),
            "partial_multi" => Some(MatchType::PartialMulti),
            "fuzzy_name" => Some(MatchType::FuzzyName),
            "credit_balance" => Some(MatchType::CreditBalance),
            _ => None,
        }
    }

    /// Tie-break rank between candidates of equal confidence; lower wins.
    pub fn precedence(&self) -> u8 {
        match self {
            MatchType::Reference => 0,
            MatchType::ExactAmountName => 1,
            MatchType::PartialMulti => 2,
            MatchType::FuzzyName => 3,
            MatchType::CreditBalance => 4,
        }
    }
}

/// Who committed an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchedBy {
    Auto,
    Human,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedBy::Auto => "auto",
            MatchedBy::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(MatchedBy::Auto),
            "human" => Some(MatchedBy::Human),
            _ => None,
        }
    }
}

/// Part of a payment applied to one invoice.
///
/// `credit_delta_minor_units` is the change to the contact's credit balance
/// committed together with this allocation: the overpayment remainder on the
/// last allocation of a payment, or minus the amount for allocations funded
/// from credit. Reversal undoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub tenant_id: String,
    pub contact_id: String,
    pub payment_id: String,
    pub invoice_id: String,
    pub amount_minor_units: i64,
    pub match_type: MatchType,
    pub matched_by: MatchedBy,
    pub confidence: u8,
    pub credit_delta_minor_units: i64,
    pub created_at: DateTime<Utc>,
    pub is_reversed: bool,
    pub reversed_at: Option<DateTime<Utc>>,
    pub reversal_reason: Option<String>,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        !self.is_reversed
    }

    /// Allocations produced by matching a payment, as opposed to credit consumption.
    pub fn is_payment_allocation(&self) -> bool {
        self.match_type != MatchType::CreditBalance
    }
}

/// Unapplied overpayment held against a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub tenant_id: String,
    pub contact_id: String,
    pub balance_minor_units: i64,
}

/// Credit still available from one payment's overpayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSource {
    pub payment_id: String,
    pub available_minor_units: i64,
    pub first_credited_at: DateTime<Utc>,
}
