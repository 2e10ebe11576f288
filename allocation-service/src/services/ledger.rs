//! Invoice ledger seam.
//!
//! The engine never mutates ledger state directly. It reads a snapshot, builds
//! a [`LedgerTransaction`] carrying the values it read as preconditions, and
//! hands it to [`LedgerStore::commit`], which applies everything or nothing.

use crate::error::AllocationError;
use crate::models::{Allocation, CreditSource, DecisionLogEntry, Invoice};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Change to one invoice's amount due, guarded by the value it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceUpdate {
    pub invoice_id: String,
    pub expected_amount_due_minor_units: i64,
    pub delta_minor_units: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationReversal {
    pub allocation_id: Uuid,
    pub reversed_at: DateTime<Utc>,
    pub reason: String,
}

/// Change to a contact's credit balance, guarded by the balance it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditUpdate {
    pub contact_id: String,
    pub expected_balance_minor_units: i64,
    pub delta_minor_units: i64,
}

/// Additional checks a commit must pass before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentGuard {
    /// No matching decision has been recorded for the payment and it has no
    /// active allocations. The payment id becomes the decision's idempotency key.
    FirstDecision(String),
    /// The payment has no active allocations produced by matching.
    Unallocated(String),
}

impl PaymentGuard {
    pub fn payment_id(&self) -> &str {
        match self {
            PaymentGuard::FirstDecision(id) | PaymentGuard::Unallocated(id) => id,
        }
    }
}

/// Everything one decision writes, committed atomically.
#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    pub tenant_id: String,
    pub guard: Option<PaymentGuard>,
    pub invoice_updates: Vec<InvoiceUpdate>,
    pub new_allocations: Vec<Allocation>,
    pub reversals: Vec<AllocationReversal>,
    pub credit: Option<CreditUpdate>,
    pub decision: DecisionLogEntry,
}

impl LedgerTransaction {
    pub fn new(tenant_id: &str, decision: DecisionLogEntry) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            guard: None,
            invoice_updates: Vec::new(),
            new_allocations: Vec::new(),
            reversals: Vec::new(),
            credit: None,
            decision,
        }
    }

    pub fn with_guard(mut self, guard: PaymentGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Idempotency key recorded with the decision, if any.
    pub fn idempotency_key(&self) -> Option<&str> {
        match &self.guard {
            Some(PaymentGuard::FirstDecision(id)) => Some(id),
            _ => None,
        }
    }

    /// Apply an allocation and the matching amount-due change for its invoice.
    pub fn allocate(&mut self, invoice: &Invoice, allocation: Allocation) {
        let amount = allocation.amount_minor_units;
        self.push_invoice_delta(invoice, -amount);
        self.new_allocations.push(allocation);
    }

    /// Reverse an allocation and restore its invoice's amount due.
    pub fn reverse(&mut self, invoice: &Invoice, allocation: &Allocation, reason: &str) {
        self.push_invoice_delta(invoice, allocation.amount_minor_units);
        self.reversals.push(AllocationReversal {
            allocation_id: allocation.id,
            reversed_at: Utc::now(),
            reason: reason.to_string(),
        });
    }

    pub fn adjust_credit(&mut self, contact_id: &str, expected_balance: i64, delta: i64) {
        match &mut self.credit {
            Some(credit) => credit.delta_minor_units += delta,
            None => {
                self.credit = Some(CreditUpdate {
                    contact_id: contact_id.to_string(),
                    expected_balance_minor_units: expected_balance,
                    delta_minor_units: delta,
                })
            }
        }
    }

    /// Whether the transaction changes anything besides the decision log.
    pub fn mutates_ledger(&self) -> bool {
        !self.invoice_updates.is_empty()
            || !self.new_allocations.is_empty()
            || !self.reversals.is_empty()
            || self.credit.as_ref().is_some_and(|c| c.delta_minor_units != 0)
    }

    fn push_invoice_delta(&mut self, invoice: &Invoice, delta: i64) {
        if let Some(update) = self
            .invoice_updates
            .iter_mut()
            .find(|u| u.invoice_id == invoice.id)
        {
            update.delta_minor_units += delta;
            return;
        }
        self.invoice_updates.push(InvoiceUpdate {
            invoice_id: invoice.id.clone(),
            expected_amount_due_minor_units: invoice.amount_due_minor_units,
            delta_minor_units: delta,
        });
    }
}

/// Apply `update` to a copy of the current invoice row, checking the precondition.
pub fn apply_invoice_update(
    current: &Invoice,
    update: &InvoiceUpdate,
) -> Result<Invoice, AllocationError> {
    if current.amount_due_minor_units != update.expected_amount_due_minor_units {
        return Err(AllocationError::ConcurrencyConflict(format!(
            "invoice {} amount due changed from {} to {}",
            current.id, update.expected_amount_due_minor_units, current.amount_due_minor_units
        )));
    }
    let mut updated = current.clone();
    updated.apply_amount_due_delta(update.delta_minor_units)?;
    Ok(updated)
}

/// New credit balance after `update`, checking the precondition.
pub fn apply_credit_update(current: i64, update: &CreditUpdate) -> Result<i64, AllocationError> {
    if current != update.expected_balance_minor_units {
        return Err(AllocationError::ConcurrencyConflict(format!(
            "credit balance of contact {} changed from {} to {}",
            update.contact_id, update.expected_balance_minor_units, current
        )));
    }
    let next = current + update.delta_minor_units;
    if next < 0 {
        return Err(AllocationError::ContractViolation(format!(
            "credit balance of contact {} would become negative ({})",
            update.contact_id, next
        )));
    }
    Ok(next)
}

/// Checks that need no stored state.
pub fn check_shape(tx: &LedgerTransaction) -> Result<(), AllocationError> {
    for allocation in &tx.new_allocations {
        if allocation.amount_minor_units <= 0 {
            return Err(AllocationError::ContractViolation(format!(
                "allocation amount must be positive, got {}",
                allocation.amount_minor_units
            )));
        }
        if allocation.tenant_id != tx.tenant_id {
            return Err(AllocationError::ContractViolation(format!(
                "allocation {} belongs to tenant {}, not {}",
                allocation.id, allocation.tenant_id, tx.tenant_id
            )));
        }
    }
    if tx.decision.tenant_id != tx.tenant_id {
        return Err(AllocationError::ContractViolation(
            "decision tenant does not match transaction tenant".to_string(),
        ));
    }
    Ok(())
}

/// Storage for invoices, allocations, credit balances and the decision log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open invoices of a contact, in invoice order.
    async fn find_open_invoices_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<Invoice>, AllocationError>;

    async fn get_invoice(
        &self,
        tenant_id: &str,
        invoice_id: &str,
    ) -> Result<Option<Invoice>, AllocationError>;

    /// Zero when the contact has never been credited.
    async fn get_credit_balance(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<i64, AllocationError>;

    /// All allocations attributed to a payment, reversed ones included.
    async fn allocations_for_payment(
        &self,
        tenant_id: &str,
        payment_id: &str,
    ) -> Result<Vec<Allocation>, AllocationError>;

    async fn get_allocation(
        &self,
        tenant_id: &str,
        allocation_id: Uuid,
    ) -> Result<Option<Allocation>, AllocationError>;

    /// Payments with unconsumed credit for a contact, oldest first.
    async fn credit_sources(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<CreditSource>, AllocationError>;

    /// Decision log entries of a payment, oldest first.
    async fn decisions_for_payment(
        &self,
        tenant_id: &str,
        payment_id: &str,
    ) -> Result<Vec<DecisionLogEntry>, AllocationError>;

    /// Apply a transaction atomically, or fail without side effects.
    async fn commit(&self, tx: LedgerTransaction) -> Result<(), AllocationError>;

    async fn health_check(&self) -> Result<(), AllocationError> {
        Ok(())
    }
}
