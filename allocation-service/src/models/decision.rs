//! Candidate matches and the append-only decision log.

use crate::models::{EscalationReason, MatchType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw evidence a strategy collected for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvidence {
    /// Reference extracted from the payment, when the strategy used one.
    pub reference: Option<String>,
    /// `matched amount - payment amount`.
    pub amount_delta_minor_units: i64,
    /// Payee name vs. invoice contact name, in `[0, 1]`.
    pub name_similarity: f64,
    pub invoice_count: usize,
}

impl MatchEvidence {
    pub fn amount_matches(&self) -> bool {
        self.amount_delta_minor_units == 0
    }
}

/// One way of settling a payment against one or more invoices.
///
/// Lives only for the duration of a matching run; persisted solely as part of
/// a [`DecisionLogEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    /// Invoice ids in invoice order.
    pub invoice_ids: Vec<String>,
    pub match_type: MatchType,
    /// Sum of the amount due of the matched invoices.
    pub matched_amount_minor_units: i64,
    pub evidence: MatchEvidence,
    pub confidence: u8,
}

impl CandidateMatch {
    /// Canonical identity of the invoice set, independent of order.
    pub fn invoice_set_key(&self) -> Vec<String> {
        let mut key = self.invoice_ids.clone();
        key.sort();
        key
    }
}

/// Lifecycle of a payment inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    Received,
    Matched,
    AutoApplied,
    Escalated,
    ManuallyApplied,
}

/// Outcome recorded by a decision log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionOutcome {
    AutoApplied,
    Escalated,
    ManuallyApplied,
    Reversed,
    CreditApplied,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::AutoApplied => "auto_applied",
            DecisionOutcome::Escalated => "escalated",
            DecisionOutcome::ManuallyApplied => "manually_applied",
            DecisionOutcome::Reversed => "reversed",
            DecisionOutcome::CreditApplied => "credit_applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_applied" => Some(DecisionOutcome::AutoApplied),
            "escalated" => Some(DecisionOutcome::Escalated),
            "manually_applied" => Some(DecisionOutcome::ManuallyApplied),
            "reversed" => Some(DecisionOutcome::Reversed),
            "credit_applied" => Some(DecisionOutcome::CreditApplied),
            _ => None,
        }
    }

    /// Payment state a matching decision leaves the payment in.
    pub fn payment_state(&self) -> Option<PaymentState> {
        match self {
            DecisionOutcome::AutoApplied => Some(PaymentState::AutoApplied),
            DecisionOutcome::Escalated => Some(PaymentState::Escalated),
            DecisionOutcome::ManuallyApplied => Some(PaymentState::ManuallyApplied),
            DecisionOutcome::Reversed | DecisionOutcome::CreditApplied => None,
        }
    }
}

/// Immutable audit record of one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub payment_id: Option<String>,
    pub contact_id: Option<String>,
    pub outcome: DecisionOutcome,
    pub candidates: Vec<CandidateMatch>,
    pub chosen: Option<CandidateMatch>,
    pub allocation_ids: Vec<Uuid>,
    #[serde(default)]
    pub escalation_reason: Option<EscalationReason>,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

impl DecisionLogEntry {
    pub fn new(
        tenant_id: &str,
        payment_id: Option<&str>,
        contact_id: Option<&str>,
        outcome: DecisionOutcome,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            payment_id: payment_id.map(str::to_string),
            contact_id: contact_id.map(str::to_string),
            outcome,
            candidates: Vec::new(),
            chosen: None,
            allocation_ids: Vec::new(),
            escalation_reason: None,
            reasoning: reasoning.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<CandidateMatch>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_chosen(mut self, chosen: Option<CandidateMatch>) -> Self {
        self.chosen = chosen;
        self
    }

    pub fn with_allocations(mut self, allocation_ids: Vec<Uuid>) -> Self {
        self.allocation_ids = allocation_ids;
        self
    }

    pub fn with_escalation_reason(mut self, reason: EscalationReason) -> Self {
        self.escalation_reason = Some(reason);
        self
    }

    /// Decisions that settle how a payment was matched.
    pub fn is_matching_decision(&self) -> bool {
        self.outcome.payment_state().is_some()
    }
}
