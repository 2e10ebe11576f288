//! Allocation engine: turns a payment into committed allocations or an
//! escalation, writing exactly one decision log entry per run.

use crate::config::MatchingConfig;
use crate::error::AllocationError;
use crate::matching::CandidateGenerator;
use crate::models::{
    Allocation, CandidateMatch, DecisionLogEntry, DecisionOutcome, EscalationReason,
    EscalationTicket, IncomingPayment, Invoice, ManualDecision, MatchType, MatchedBy,
    PaymentState,
};
use crate::services::escalation::EscalationQueue;
use crate::services::ledger::{LedgerStore, LedgerTransaction, PaymentGuard};
use crate::services::locks::ContactLocks;
use crate::services::metrics::{
    record_candidate, record_commit_conflict, record_error, record_payment_outcome,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// What happened to one payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationResult {
    pub payment_id: String,
    pub state: PaymentState,
    /// Active allocations produced for the payment.
    pub allocations: Vec<Allocation>,
    /// Overpayment credited to the contact.
    pub credited_minor_units: i64,
    pub chosen: Option<CandidateMatch>,
    pub candidates: Vec<CandidateMatch>,
    pub escalation_reason: Option<EscalationReason>,
    pub decision_id: Uuid,
    /// True when the payment had been decided by an earlier run.
    pub already_processed: bool,
}

impl AllocationResult {
    fn from_decision(decision: &DecisionLogEntry, allocations: Vec<Allocation>) -> Self {
        let credited = allocations
            .iter()
            .map(|a| a.credit_delta_minor_units)
            .filter(|delta| *delta > 0)
            .sum();
        Self {
            payment_id: decision.payment_id.clone().unwrap_or_default(),
            state: decision
                .outcome
                .payment_state()
                .unwrap_or(PaymentState::Matched),
            allocations,
            credited_minor_units: credited,
            chosen: decision.chosen.clone(),
            candidates: decision.candidates.clone(),
            escalation_reason: decision.escalation_reason,
            decision_id: decision.id,
            already_processed: false,
        }
    }
}

/// Result of consuming a contact's credit balance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditApplication {
    pub contact_id: String,
    pub allocations: Vec<Allocation>,
    pub consumed_minor_units: i64,
    pub remaining_balance_minor_units: i64,
    pub decision_id: Option<Uuid>,
}

/// Per-payment outcome of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub payment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AllocationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum Verdict {
    Apply(CandidateMatch),
    Escalate {
        reason: EscalationReason,
        detail: String,
    },
}

/// Outcome of one attempt, before side effects outside the ledger.
struct Settled {
    result: AllocationResult,
    ticket: Option<EscalationTicket>,
}

pub struct AllocationEngine {
    ledger: Arc<dyn LedgerStore>,
    escalations: Arc<dyn EscalationQueue>,
    locks: Arc<ContactLocks>,
    generator: CandidateGenerator,
    retry: RetryConfig,
}

impl AllocationEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        escalations: Arc<dyn EscalationQueue>,
        locks: Arc<ContactLocks>,
        config: MatchingConfig,
    ) -> Self {
        let retry = RetryConfig::quick(config.max_commit_retries);
        Self {
            ledger,
            escalations,
            locks,
            generator: CandidateGenerator::new(config),
            retry,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        self.generator.config()
    }

    /// Match a payment and either commit its allocations or escalate it.
    ///
    /// Re-processing a payment returns the earlier decision unchanged.
    #[instrument(skip(self, payment), fields(tenant_id = %payment.tenant_id, payment_id = %payment.id))]
    pub async fn process_payment(
        &self,
        payment: &IncomingPayment,
    ) -> Result<AllocationResult, AllocationError> {
        payment.validate()?;

        let contact_key = payment.contact_id.as_deref().unwrap_or_default();
        let _guard = self.locks.lock(&payment.tenant_id, contact_key).await;

        let settled = match retry_with_backoff(&self.retry, "process_payment", move || {
            self.attempt_payment(payment)
        })
        .await
        {
            Ok(settled) => settled,
            Err(AllocationError::ConcurrencyConflict(detail)) => {
                warn!(error = %detail, "Ledger contention outlasted retries, escalating");
                self.escalate_contention(payment, &detail).await?
            }
            Err(e) => {
                record_error(e.kind());
                return Err(e);
            }
        };

        if let Some(ticket) = settled.ticket {
            self.escalations.push(ticket).await.map_err(|e| {
                error!(error = %e, "Failed to enqueue escalation");
                AllocationError::EscalationError(e.to_string())
            })?;
        }

        let result = settled.result;
        if !result.already_processed {
            record_payment_outcome(state_label(result.state));
            info!(
                state = state_label(result.state),
                allocations = result.allocations.len(),
                credited = result.credited_minor_units,
                "Payment processed"
            );
        }
        Ok(result)
    }

    async fn attempt_payment(&self, payment: &IncomingPayment) -> Result<Settled, AllocationError> {
        if let Some(prior) = self.prior_result(payment).await? {
            return Ok(prior);
        }

        let Some(contact_id) = payment.contact_id.as_deref() else {
            return self
                .commit_escalation(
                    payment,
                    Vec::new(),
                    EscalationReason::NoContact,
                    "payment could not be attributed to a contact".to_string(),
                )
                .await;
        };

        let invoices = self
            .ledger
            .find_open_invoices_for_contact(&payment.tenant_id, contact_id)
            .await?;
        let candidates = self.generator.generate(payment, &invoices);
        for candidate in &candidates {
            record_candidate(candidate.match_type.as_str());
        }

        match self.decide(payment, &candidates) {
            Verdict::Escalate { reason, detail } => {
                self.commit_escalation(payment, candidates, reason, detail)
                    .await
            }
            Verdict::Apply(chosen) => {
                let balance = self
                    .ledger
                    .get_credit_balance(&payment.tenant_id, contact_id)
                    .await?;
                let by_id: HashMap<&str, &Invoice> =
                    invoices.iter().map(|inv| (inv.id.as_str(), inv)).collect();
                let mut lines = Vec::with_capacity(chosen.invoice_ids.len());
                let mut remaining = payment.amount_minor_units;
                for invoice_id in &chosen.invoice_ids {
                    let invoice = by_id.get(invoice_id.as_str()).ok_or_else(|| {
                        AllocationError::NotFound(format!("invoice {}", invoice_id))
                    })?;
                    let amount = remaining.min(invoice.amount_due_minor_units);
                    if amount > 0 {
                        lines.push((*invoice, amount));
                        remaining -= amount;
                    }
                }

                let reasoning = format!(
                    "{} match on {} invoice(s) with confidence {}",
                    chosen.match_type.as_str(),
                    chosen.invoice_ids.len(),
                    chosen.confidence
                );
                let decision = DecisionLogEntry::new(
                    &payment.tenant_id,
                    Some(&payment.id),
                    Some(contact_id),
                    DecisionOutcome::AutoApplied,
                    reasoning,
                )
                .with_candidates(candidates)
                .with_chosen(Some(chosen.clone()));

                let tx = build_allocation_transaction(
                    payment,
                    contact_id,
                    &lines,
                    chosen.match_type,
                    MatchedBy::Auto,
                    chosen.confidence,
                    balance,
                    decision,
                )?
                .with_guard(PaymentGuard::FirstDecision(payment.id.clone()));

                self.commit_settled(payment, tx, None).await
            }
        }
    }

    /// Apply the decision rule to the ranked candidates.
    fn decide(&self, payment: &IncomingPayment, candidates: &[CandidateMatch]) -> Verdict {
        let Some(best) = candidates.first() else {
            return Verdict::Escalate {
                reason: EscalationReason::NoCandidates,
                detail: "no invoice matched the payment".to_string(),
            };
        };

        let threshold = self.config().auto_apply_threshold;
        if best.confidence < threshold {
            return Verdict::Escalate {
                reason: EscalationReason::LowConfidence,
                detail: format!(
                    "best candidate ({}) scored {} below {}",
                    best.match_type.as_str(),
                    best.confidence,
                    threshold
                ),
            };
        }
        if best.match_type != MatchType::Reference
            && best.matched_amount_minor_units != payment.amount_minor_units
        {
            return Verdict::Escalate {
                reason: EscalationReason::LowConfidence,
                detail: format!(
                    "matched amount {} differs from payment amount {}",
                    best.matched_amount_minor_units, payment.amount_minor_units
                ),
            };
        }
        // A tie only counts when the same strategy produced both candidates;
        // a quoted reference outranks an equal-scoring amount match.
        if let Some(runner_up) = candidates.get(1) {
            if runner_up.confidence == best.confidence
                && runner_up.match_type == best.match_type
                && runner_up.invoice_set_key() != best.invoice_set_key()
            {
                return Verdict::Escalate {
                    reason: EscalationReason::AmbiguousMatch,
                    detail: format!(
                        "{} and {} both scored {}",
                        best.invoice_ids.join(","),
                        runner_up.invoice_ids.join(","),
                        best.confidence
                    ),
                };
            }
        }
        Verdict::Apply(best.clone())
    }

    async fn commit_escalation(
        &self,
        payment: &IncomingPayment,
        candidates: Vec<CandidateMatch>,
        reason: EscalationReason,
        detail: String,
    ) -> Result<Settled, AllocationError> {
        let decision = DecisionLogEntry::new(
            &payment.tenant_id,
            Some(&payment.id),
            payment.contact_id.as_deref(),
            DecisionOutcome::Escalated,
            detail.clone(),
        )
        .with_candidates(candidates.clone())
        .with_escalation_reason(reason);

        let mut ticket = EscalationTicket::new(payment, reason, detail);
        ticket.candidates = candidates;
        ticket.decision_id = Some(decision.id);

        let tx = LedgerTransaction::new(&payment.tenant_id, decision)
            .with_guard(PaymentGuard::FirstDecision(payment.id.clone()));
        self.commit_settled(payment, tx, Some(ticket)).await
    }

    /// Commit, translating a lost idempotency race into the winner's result.
    async fn commit_settled(
        &self,
        payment: &IncomingPayment,
        tx: LedgerTransaction,
        ticket: Option<EscalationTicket>,
    ) -> Result<Settled, AllocationError> {
        let decision = tx.decision.clone();
        let allocations = tx.new_allocations.clone();

        match self.ledger.commit(tx).await {
            Ok(()) => Ok(Settled {
                result: AllocationResult::from_decision(&decision, allocations),
                ticket,
            }),
            Err(AllocationError::AlreadyProcessed(_)) => {
                self.prior_result(payment).await?.ok_or_else(|| {
                    AllocationError::AlreadyProcessed(payment.id.clone())
                })
            }
            Err(e @ AllocationError::ConcurrencyConflict(_)) => {
                record_commit_conflict("process_payment");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn escalate_contention(
        &self,
        payment: &IncomingPayment,
        detail: &str,
    ) -> Result<Settled, AllocationError> {
        retry_with_backoff(&self.retry, "escalate_contention", move || {
            self.commit_escalation(
                payment,
                Vec::new(),
                EscalationReason::LedgerContention,
                format!("ledger kept changing during commit: {}", detail),
            )
        })
        .await
    }

    /// Result of an earlier matching decision for this payment, if any.
    ///
    /// A still-escalated payment gets its ticket re-enqueued so a lost push
    /// is repaired by re-delivery.
    async fn prior_result(
        &self,
        payment: &IncomingPayment,
    ) -> Result<Option<Settled>, AllocationError> {
        let decisions = self
            .ledger
            .decisions_for_payment(&payment.tenant_id, &payment.id)
            .await?;
        let Some(latest) = decisions.iter().rev().find(|d| d.is_matching_decision()) else {
            return Ok(None);
        };

        let allocations: Vec<Allocation> = self
            .ledger
            .allocations_for_payment(&payment.tenant_id, &payment.id)
            .await?
            .into_iter()
            .filter(|a| a.is_active() && a.is_payment_allocation())
            .collect();

        let mut result = AllocationResult::from_decision(latest, allocations);
        result.already_processed = true;

        let ticket = match (result.state, latest.escalation_reason) {
            (PaymentState::Escalated, Some(reason)) => {
                let mut ticket = EscalationTicket::new(payment, reason, latest.reasoning.clone());
                ticket.candidates = latest.candidates.clone();
                ticket.decision_id = Some(latest.id);
                Some(ticket)
            }
            _ => None,
        };

        info!(decision_id = %latest.id, "Payment already processed");
        Ok(Some(Settled { result, ticket }))
    }

    /// Apply a reviewer's allocation for an escalated payment.
    #[instrument(skip(self, decision), fields(tenant_id = %decision.payment.tenant_id, payment_id = %decision.payment.id))]
    pub async fn apply_manual_decision(
        &self,
        decision: &ManualDecision,
    ) -> Result<AllocationResult, AllocationError> {
        decision.validate()?;
        decision.payment.validate()?;
        if decision.match_type == MatchType::CreditBalance {
            return Err(AllocationError::ValidationError(
                "manual decisions cannot use the credit balance match type".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for line in &decision.lines {
            if line.amount_minor_units <= 0 {
                return Err(AllocationError::ValidationError(format!(
                    "amount for invoice {} must be positive",
                    line.invoice_id
                )));
            }
            if !seen.insert(line.invoice_id.as_str()) {
                return Err(AllocationError::ValidationError(format!(
                    "invoice {} appears more than once",
                    line.invoice_id
                )));
            }
        }
        let contact_id = decision
            .contact_id
            .as_deref()
            .or(decision.payment.contact_id.as_deref())
            .ok_or_else(|| {
                AllocationError::ValidationError(
                    "a contact is required to apply a payment".to_string(),
                )
            })?;

        let payment = &decision.payment;
        let _guard = self.locks.lock(&payment.tenant_id, contact_id).await;

        let result = retry_with_backoff(&self.retry, "apply_manual_decision", move || {
            self.attempt_manual(decision, contact_id)
        })
        .await
        .inspect_err(|e| record_error(e.kind()))?;

        if !self
            .escalations
            .resolve(&payment.tenant_id, &payment.id)
            .await?
        {
            info!("No pending escalation to resolve");
        }

        record_payment_outcome(state_label(result.state));
        info!(
            reviewer = %decision.reviewer,
            allocations = result.allocations.len(),
            "Manual decision applied"
        );
        Ok(result)
    }

    async fn attempt_manual(
        &self,
        decision: &ManualDecision,
        contact_id: &str,
    ) -> Result<AllocationResult, AllocationError> {
        let payment = &decision.payment;

        let mut invoices = Vec::with_capacity(decision.lines.len());
        for line in &decision.lines {
            let invoice = self
                .ledger
                .get_invoice(&payment.tenant_id, &line.invoice_id)
                .await?
                .ok_or_else(|| AllocationError::NotFound(format!("invoice {}", line.invoice_id)))?;
            if invoice.contact_id != contact_id {
                return Err(AllocationError::ValidationError(format!(
                    "invoice {} does not belong to contact {}",
                    invoice.id, contact_id
                )));
            }
            if !invoice.is_open() || line.amount_minor_units > invoice.amount_due_minor_units {
                return Err(AllocationError::ContractViolation(format!(
                    "invoice {} has {} due, cannot allocate {}",
                    invoice.id, invoice.amount_due_minor_units, line.amount_minor_units
                )));
            }
            invoices.push(invoice);
        }
        invoices.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        let amounts: HashMap<&str, i64> = decision
            .lines
            .iter()
            .map(|l| (l.invoice_id.as_str(), l.amount_minor_units))
            .collect();
        let lines: Vec<(&Invoice, i64)> = invoices
            .iter()
            .map(|inv| (inv, amounts.get(inv.id.as_str()).copied().unwrap_or(0)))
            .collect();

        // Score the reviewer's choice with whatever the engine logged for it.
        let logged: Vec<CandidateMatch> = self
            .ledger
            .decisions_for_payment(&payment.tenant_id, &payment.id)
            .await?
            .into_iter()
            .rev()
            .find(|d| d.outcome == DecisionOutcome::Escalated)
            .map(|d| d.candidates)
            .unwrap_or_default();
        let mut chosen_key: Vec<String> = invoices.iter().map(|inv| inv.id.clone()).collect();
        chosen_key.sort();
        let chosen = logged
            .iter()
            .find(|c| c.invoice_set_key() == chosen_key)
            .cloned();
        let confidence = chosen.as_ref().map_or(0, |c| c.confidence);

        let balance = self
            .ledger
            .get_credit_balance(&payment.tenant_id, contact_id)
            .await?;
        let mut reasoning = format!("applied by {}", decision.reviewer);
        if let Some(note) = &decision.note {
            reasoning.push_str(": ");
            reasoning.push_str(note);
        }
        let entry = DecisionLogEntry::new(
            &payment.tenant_id,
            Some(&payment.id),
            Some(contact_id),
            DecisionOutcome::ManuallyApplied,
            reasoning,
        )
        .with_candidates(logged)
        .with_chosen(chosen);

        let tx = build_allocation_transaction(
            payment,
            contact_id,
            &lines,
            decision.match_type,
            MatchedBy::Human,
            confidence,
            balance,
            entry,
        )?
        .with_guard(PaymentGuard::Unallocated(payment.id.clone()));

        let entry = tx.decision.clone();
        let allocations = tx.new_allocations.clone();
        if let Err(e) = self.ledger.commit(tx).await {
            if matches!(e, AllocationError::ConcurrencyConflict(_)) {
                record_commit_conflict("apply_manual_decision");
            }
            return Err(e);
        }
        Ok(AllocationResult::from_decision(&entry, allocations))
    }

    /// Consume a contact's credit balance against its open invoices, oldest
    /// invoice and oldest credit first.
    #[instrument(skip(self))]
    pub async fn apply_credit_balance(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<CreditApplication, AllocationError> {
        if tenant_id.is_empty() || contact_id.is_empty() {
            return Err(AllocationError::ValidationError(
                "tenant and contact are required".to_string(),
            ));
        }
        let _guard = self.locks.lock(tenant_id, contact_id).await;

        let application = retry_with_backoff(&self.retry, "apply_credit_balance", move || {
            self.attempt_credit(tenant_id, contact_id)
        })
        .await
        .inspect_err(|e| record_error(e.kind()))?;

        info!(
            consumed = application.consumed_minor_units,
            remaining = application.remaining_balance_minor_units,
            "Credit balance applied"
        );
        Ok(application)
    }

    async fn attempt_credit(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<CreditApplication, AllocationError> {
        let balance = self.ledger.get_credit_balance(tenant_id, contact_id).await?;
        let mut application = CreditApplication {
            contact_id: contact_id.to_string(),
            allocations: Vec::new(),
            consumed_minor_units: 0,
            remaining_balance_minor_units: balance,
            decision_id: None,
        };
        if balance <= 0 {
            return Ok(application);
        }

        let invoices = self
            .ledger
            .find_open_invoices_for_contact(tenant_id, contact_id)
            .await?;
        let mut sources = self.ledger.credit_sources(tenant_id, contact_id).await?;
        let mut budget = balance;

        let mut decision = DecisionLogEntry::new(
            tenant_id,
            None,
            Some(contact_id),
            DecisionOutcome::CreditApplied,
            String::new(),
        );
        let mut tx = LedgerTransaction::new(tenant_id, decision.clone());
        let mut source_index = 0;
        let now = Utc::now();

        for invoice in &invoices {
            let mut due = invoice.amount_due_minor_units;
            while due > 0 && budget > 0 && source_index < sources.len() {
                let source = &mut sources[source_index];
                let amount = due.min(source.available_minor_units).min(budget);
                if amount <= 0 {
                    source_index += 1;
                    continue;
                }
                let allocation = Allocation {
                    id: Uuid::new_v4(),
                    tenant_id: tenant_id.to_string(),
                    contact_id: contact_id.to_string(),
                    payment_id: source.payment_id.clone(),
                    invoice_id: invoice.id.clone(),
                    amount_minor_units: amount,
                    match_type: MatchType::CreditBalance,
                    matched_by: MatchedBy::Auto,
                    confidence: 100,
                    credit_delta_minor_units: -amount,
                    created_at: now,
                    is_reversed: false,
                    reversed_at: None,
                    reversal_reason: None,
                };
                tx.allocate(invoice, allocation);
                source.available_minor_units -= amount;
                due -= amount;
                budget -= amount;
                if source.available_minor_units == 0 {
                    source_index += 1;
                }
            }
        }

        let consumed = balance - budget;
        if consumed == 0 {
            return Ok(application);
        }
        tx.adjust_credit(contact_id, balance, -consumed);

        decision.allocation_ids = tx.new_allocations.iter().map(|a| a.id).collect();
        decision.reasoning = format!(
            "consumed {} of credit across {} invoice(s)",
            consumed,
            tx.invoice_updates.len()
        );
        tx.decision = decision;

        application.allocations = tx.new_allocations.clone();
        application.consumed_minor_units = consumed;
        application.remaining_balance_minor_units = budget;
        application.decision_id = Some(tx.decision.id);

        if let Err(e) = self.ledger.commit(tx).await {
            if matches!(e, AllocationError::ConcurrencyConflict(_)) {
                record_commit_conflict("apply_credit_balance");
            }
            return Err(e);
        }
        Ok(application)
    }

    /// Process many payments with bounded concurrency. One payment failing
    /// never affects the others; failures are escalated with their error.
    #[instrument(skip(self, payments), fields(batch_size = payments.len()))]
    pub async fn process_batch(&self, payments: Vec<IncomingPayment>) -> Vec<BatchItem> {
        let concurrency = self.config().batch_concurrency.max(1);

        stream::iter(payments)
            .map(|payment| async move {
                match self.process_payment(&payment).await {
                    Ok(result) => BatchItem {
                        payment_id: payment.id.clone(),
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => {
                        warn!(payment_id = %payment.id, error = %e, "Payment failed in batch");
                        let ticket = EscalationTicket::new(
                            &payment,
                            EscalationReason::ProcessingError,
                            e.to_string(),
                        );
                        if let Err(push_err) = self.escalations.push(ticket).await {
                            error!(
                                payment_id = %payment.id,
                                error = %push_err,
                                "Failed to enqueue failed payment"
                            );
                        }
                        BatchItem {
                            payment_id: payment.id.clone(),
                            result: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .buffered(concurrency)
            .collect()
            .await
    }
}

/// Build allocations for `lines` (invoice order) and the matching ledger
/// transaction. Any part of the payment left over is credited to the contact
/// and recorded on the last allocation.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_allocation_transaction(
    payment: &IncomingPayment,
    contact_id: &str,
    lines: &[(&Invoice, i64)],
    match_type: MatchType,
    matched_by: MatchedBy,
    confidence: u8,
    credit_balance: i64,
    mut decision: DecisionLogEntry,
) -> Result<LedgerTransaction, AllocationError> {
    if lines.is_empty() {
        return Err(AllocationError::ContractViolation(format!(
            "payment {} has nothing to allocate",
            payment.id
        )));
    }
    let allocated: i64 = lines.iter().map(|(_, amount)| amount).sum();
    if lines.iter().any(|(_, amount)| *amount <= 0) {
        return Err(AllocationError::ContractViolation(
            "allocation amounts must be positive".to_string(),
        ));
    }
    if allocated > payment.amount_minor_units {
        return Err(AllocationError::ContractViolation(format!(
            "allocating {} exceeds payment amount {}",
            allocated, payment.amount_minor_units
        )));
    }
    let remainder = payment.amount_minor_units - allocated;

    let now = Utc::now();
    let mut allocations: Vec<Allocation> = lines
        .iter()
        .map(|(invoice, amount)| Allocation {
            id: Uuid::new_v4(),
            tenant_id: payment.tenant_id.clone(),
            contact_id: contact_id.to_string(),
            payment_id: payment.id.clone(),
            invoice_id: invoice.id.clone(),
            amount_minor_units: *amount,
            match_type,
            matched_by,
            confidence,
            credit_delta_minor_units: 0,
            created_at: now,
            is_reversed: false,
            reversed_at: None,
            reversal_reason: None,
        })
        .collect();
    if let Some(last) = allocations.last_mut() {
        last.credit_delta_minor_units = remainder;
    }

    decision.allocation_ids = allocations.iter().map(|a| a.id).collect();
    let mut tx = LedgerTransaction::new(&payment.tenant_id, decision);
    for ((invoice, _), allocation) in lines.iter().zip(allocations) {
        tx.allocate(invoice, allocation);
    }
    if remainder > 0 {
        tx.adjust_credit(contact_id, credit_balance, remainder);
    }
    Ok(tx)
}

fn state_label(state: PaymentState) -> &'static str {
    match state {
        PaymentState::Received => "received",
        PaymentState::Matched => "matched",
        PaymentState::AutoApplied => "auto_applied",
        PaymentState::Escalated => "escalated",
        PaymentState::ManuallyApplied => "manually_applied",
    }
}
