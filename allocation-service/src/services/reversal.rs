//! Reversal of committed allocations.

use crate::error::AllocationError;
use crate::models::{Allocation, DecisionLogEntry, DecisionOutcome, Invoice};
use crate::services::ledger::{LedgerStore, LedgerTransaction};
use crate::services::locks::ContactLocks;
use crate::services::metrics::{record_commit_conflict, record_reversal};
use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReversalResult {
    pub allocation: Allocation,
    pub invoice: Invoice,
    /// Change applied to the contact's credit balance by the reversal.
    pub credit_delta_minor_units: i64,
    pub decision_id: Uuid,
}

pub struct ReversalManager {
    ledger: Arc<dyn LedgerStore>,
    locks: Arc<ContactLocks>,
    retry: RetryConfig,
}

impl ReversalManager {
    pub fn new(ledger: Arc<dyn LedgerStore>, locks: Arc<ContactLocks>, max_retries: u32) -> Self {
        Self {
            ledger,
            locks,
            retry: RetryConfig::quick(max_retries),
        }
    }

    /// Undo one allocation: restore the invoice's amount due, undo the credit
    /// the allocation moved and mark it reversed. The record is kept.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, allocation_id = %allocation_id))]
    pub async fn reverse(
        &self,
        tenant_id: &str,
        allocation_id: Uuid,
        reason: &str,
    ) -> Result<ReversalResult, AllocationError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AllocationError::ValidationError(
                "a reversal reason is required".to_string(),
            ));
        }

        let allocation = self.load(tenant_id, allocation_id).await?;
        let _guard = self.locks.lock(tenant_id, &allocation.contact_id).await;

        let result = retry_with_backoff(&self.retry, "reverse_allocation", move || {
            self.attempt(tenant_id, allocation_id, reason)
        })
        .await;

        match result {
            Ok(result) => {
                record_reversal("success");
                info!(
                    invoice_id = %result.invoice.id,
                    amount = result.allocation.amount_minor_units,
                    credit_delta = result.credit_delta_minor_units,
                    "Allocation reversed"
                );
                Ok(result)
            }
            Err(e) => {
                record_reversal(e.kind());
                Err(e)
            }
        }
    }

    async fn load(
        &self,
        tenant_id: &str,
        allocation_id: Uuid,
    ) -> Result<Allocation, AllocationError> {
        let allocation = self
            .ledger
            .get_allocation(tenant_id, allocation_id)
            .await?
            .ok_or_else(|| AllocationError::NotFound(format!("allocation {}", allocation_id)))?;
        if allocation.is_reversed {
            return Err(AllocationError::ReversalConflict(format!(
                "allocation {} is already reversed",
                allocation_id
            )));
        }
        Ok(allocation)
    }

    async fn attempt(
        &self,
        tenant_id: &str,
        allocation_id: Uuid,
        reason: &str,
    ) -> Result<ReversalResult, AllocationError> {
        let allocation = self.load(tenant_id, allocation_id).await?;
        let invoice = self
            .ledger
            .get_invoice(tenant_id, &allocation.invoice_id)
            .await?
            .ok_or_else(|| {
                AllocationError::NotFound(format!("invoice {}", allocation.invoice_id))
            })?;

        let credit_delta = -allocation.credit_delta_minor_units;
        if allocation.credit_delta_minor_units > 0 {
            // The credit this allocation created must still be unconsumed.
            let net_credit: i64 = self
                .ledger
                .allocations_for_payment(tenant_id, &allocation.payment_id)
                .await?
                .iter()
                .filter(|a| a.is_active() && a.contact_id == allocation.contact_id)
                .map(|a| a.credit_delta_minor_units)
                .sum();
            if net_credit - allocation.credit_delta_minor_units < 0 {
                return Err(AllocationError::ReversalConflict(format!(
                    "credit from payment {} has already been applied; reverse those allocations first",
                    allocation.payment_id
                )));
            }
        }

        let decision = DecisionLogEntry::new(
            tenant_id,
            Some(&allocation.payment_id),
            Some(&allocation.contact_id),
            DecisionOutcome::Reversed,
            reason,
        )
        .with_allocations(vec![allocation.id]);

        let mut tx = LedgerTransaction::new(tenant_id, decision);
        tx.reverse(&invoice, &allocation, reason);
        if credit_delta != 0 {
            let balance = self
                .ledger
                .get_credit_balance(tenant_id, &allocation.contact_id)
                .await?;
            tx.adjust_credit(&allocation.contact_id, balance, credit_delta);
        }
        let decision_id = tx.decision.id;
        let reversed_at = tx.reversals[0].reversed_at;

        if let Err(e) = self.ledger.commit(tx).await {
            if matches!(e, AllocationError::ConcurrencyConflict(_)) {
                record_commit_conflict("reverse_allocation");
            }
            return Err(e);
        }

        let mut invoice = invoice;
        invoice.apply_amount_due_delta(allocation.amount_minor_units)?;
        let mut allocation = allocation;
        allocation.is_reversed = true;
        allocation.reversed_at = Some(reversed_at);
        allocation.reversal_reason = Some(reason.to_string());

        Ok(ReversalResult {
            allocation,
            invoice,
            credit_delta_minor_units: credit_delta,
            decision_id,
        })
    }
}
