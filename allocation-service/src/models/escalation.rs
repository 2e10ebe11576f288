//! Escalation tickets and the human decisions that resolve them.

use crate::models::{CandidateMatch, IncomingPayment, MatchType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationReason {
    /// Best candidate below the auto-apply threshold, or amount mismatch.
    LowConfidence,
    /// Two different invoice sets share the best confidence.
    AmbiguousMatch,
    NoCandidates,
    /// Payment could not be attributed to a contact.
    NoContact,
    /// Ledger kept changing underneath the commit.
    LedgerContention,
    /// Processing failed (validation, missing data, storage).
    ProcessingError,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::LowConfidence => "low_confidence",
            EscalationReason::AmbiguousMatch => "ambiguous_match",
            EscalationReason::NoCandidates => "no_candidates",
            EscalationReason::NoContact => "no_contact",
            EscalationReason::LedgerContention => "ledger_contention",
            EscalationReason::ProcessingError => "processing_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low_confidence" => Some(EscalationReason::LowConfidence),
            "ambiguous_match" => Some(EscalationReason::AmbiguousMatch),
            "no_candidates" => Some(EscalationReason::NoCandidates),
            "no_contact" => Some(EscalationReason::NoContact),
            "ledger_contention" => Some(EscalationReason::LedgerContention),
            "processing_error" => Some(EscalationReason::ProcessingError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    Pending,
    Resolved,
}

/// A payment waiting for a human reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationTicket {
    pub tenant_id: String,
    pub payment: IncomingPayment,
    pub reason: EscalationReason,
    pub detail: String,
    pub candidates: Vec<CandidateMatch>,
    pub decision_id: Option<Uuid>,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationTicket {
    pub fn new(payment: &IncomingPayment, reason: EscalationReason, detail: impl Into<String>) -> Self {
        Self {
            tenant_id: payment.tenant_id.clone(),
            payment: payment.clone(),
            reason,
            detail: detail.into(),
            candidates: Vec::new(),
            decision_id: None,
            status: EscalationStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// One invoice and amount chosen by the reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAllocationLine {
    pub invoice_id: String,
    pub amount_minor_units: i64,
}

/// A reviewer's resolution of an escalated payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ManualDecision {
    pub payment: IncomingPayment,
    /// Contact to attribute the payment to when the bank feed had none.
    #[serde(default)]
    pub contact_id: Option<String>,
    #[validate(length(min = 1, message = "at least one invoice line is required"))]
    pub lines: Vec<ManualAllocationLine>,
    pub match_type: MatchType,
    #[validate(length(min = 1, message = "reviewer is required"))]
    pub reviewer: String,
    #[serde(default)]
    pub note: Option<String>,
}
