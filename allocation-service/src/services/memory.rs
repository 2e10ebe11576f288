//! In-process ledger backend.

use crate::error::AllocationError;
use crate::models::{Allocation, CreditSource, DecisionLogEntry, Invoice};
use crate::services::ledger::{
    apply_credit_update, apply_invoice_update, check_shape, LedgerStore, LedgerTransaction,
    PaymentGuard,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

type Key = (String, String);

fn key(tenant_id: &str, id: &str) -> Key {
    (tenant_id.to_string(), id.to_string())
}

#[derive(Debug, Default)]
struct LedgerState {
    invoices: HashMap<Key, Invoice>,
    allocations: Vec<Allocation>,
    credit_balances: HashMap<Key, i64>,
    decisions: Vec<DecisionLogEntry>,
    idempotency_keys: HashSet<Key>,
}

/// Ledger held in memory behind a single lock. Commits are serialized, which
/// makes every transaction trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    injected_conflicts: AtomicU32,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an invoice, as the invoicing service would.
    pub async fn upsert_invoice(&self, invoice: Invoice) -> Result<(), AllocationError> {
        invoice.check_consistency()?;
        let mut state = self.state.write().await;
        state
            .invoices
            .insert(key(&invoice.tenant_id, &invoice.id), invoice);
        Ok(())
    }

    /// Make the next `count` commits fail with a concurrency conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub async fn invoices(&self, tenant_id: &str) -> Vec<Invoice> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|inv| inv.tenant_id == tenant_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        invoices
    }

    pub async fn allocations(&self, tenant_id: &str) -> Vec<Allocation> {
        let state = self.state.read().await;
        state
            .allocations
            .iter()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn decisions(&self, tenant_id: &str) -> Vec<DecisionLogEntry> {
        let state = self.state.read().await;
        state
            .decisions
            .iter()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl LedgerState {
    fn check_guard(&self, tenant_id: &str, guard: &PaymentGuard) -> Result<(), AllocationError> {
        let payment_id = guard.payment_id();
        let allocated = self.allocations.iter().any(|a| {
            a.tenant_id == tenant_id
                && a.payment_id == payment_id
                && a.is_active()
                && a.is_payment_allocation()
        });
        let taken = match guard {
            PaymentGuard::FirstDecision(_) => {
                allocated || self.idempotency_keys.contains(&key(tenant_id, payment_id))
            }
            PaymentGuard::Unallocated(_) => allocated,
        };
        if taken {
            return Err(AllocationError::AlreadyProcessed(payment_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn find_open_invoices_for_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<Invoice>, AllocationError> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|inv| {
                inv.tenant_id == tenant_id && inv.contact_id == contact_id && inv.is_open()
            })
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(invoices)
    }

    async fn get_invoice(
        &self,
        tenant_id: &str,
        invoice_id: &str,
    ) -> Result<Option<Invoice>, AllocationError> {
        let state = self.state.read().await;
        Ok(state.invoices.get(&key(tenant_id, invoice_id)).cloned())
    }

    async fn get_credit_balance(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<i64, AllocationError> {
        let state = self.state.read().await;
        Ok(state
            .credit_balances
            .get(&key(tenant_id, contact_id))
            .copied()
            .unwrap_or(0))
    }

    async fn allocations_for_payment(
        &self,
        tenant_id: &str,
        payment_id: &str,
    ) -> Result<Vec<Allocation>, AllocationError> {
        let state = self.state.read().await;
        Ok(state
            .allocations
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn get_allocation(
        &self,
        tenant_id: &str,
        allocation_id: Uuid,
    ) -> Result<Option<Allocation>, AllocationError> {
        let state = self.state.read().await;
        Ok(state
            .allocations
            .iter()
            .find(|a| a.tenant_id == tenant_id && a.id == allocation_id)
            .cloned())
    }

    async fn credit_sources(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Vec<CreditSource>, AllocationError> {
        let state = self.state.read().await;
        let mut sources: HashMap<&str, CreditSource> = HashMap::new();
        for allocation in state.allocations.iter().filter(|a| {
            a.tenant_id == tenant_id
                && a.contact_id == contact_id
                && a.is_active()
                && a.credit_delta_minor_units != 0
        }) {
            let source = sources
                .entry(allocation.payment_id.as_str())
                .or_insert_with(|| CreditSource {
                    payment_id: allocation.payment_id.clone(),
                    available_minor_units: 0,
                    first_credited_at: allocation.created_at,
                });
            source.available_minor_units += allocation.credit_delta_minor_units;
            if allocation.credit_delta_minor_units > 0
                && allocation.created_at < source.first_credited_at
            {
                source.first_credited_at = allocation.created_at;
            }
        }

        let mut sources: Vec<CreditSource> = sources
            .into_values()
            .filter(|s| s.available_minor_units > 0)
            .collect();
        sources.sort_by(|a, b| {
            a.first_credited_at
                .cmp(&b.first_credited_at)
                .then_with(|| a.payment_id.cmp(&b.payment_id))
        });
        Ok(sources)
    }

    async fn decisions_for_payment(
        &self,
        tenant_id: &str,
        payment_id: &str,
    ) -> Result<Vec<DecisionLogEntry>, AllocationError> {
        let state = self.state.read().await;
        Ok(state
            .decisions
            .iter()
            .filter(|d| d.tenant_id == tenant_id && d.payment_id.as_deref() == Some(payment_id))
            .cloned()
            .collect())
    }

    #[instrument(skip(self, tx), fields(tenant_id = %tx.tenant_id, decision_id = %tx.decision.id))]
    async fn commit(&self, tx: LedgerTransaction) -> Result<(), AllocationError> {
        check_shape(&tx)?;
        let mut state = self.state.write().await;

        if self.take_injected_conflict() {
            return Err(AllocationError::ConcurrencyConflict(
                "injected conflict".to_string(),
            ));
        }

        if let Some(guard) = &tx.guard {
            state.check_guard(&tx.tenant_id, guard)?;
        }

        // Validate everything against the current state before writing anything.
        let mut reversal_indexes = Vec::with_capacity(tx.reversals.len());
        for reversal in &tx.reversals {
            let index = state
                .allocations
                .iter()
                .position(|a| a.tenant_id == tx.tenant_id && a.id == reversal.allocation_id)
                .ok_or_else(|| {
                    AllocationError::NotFound(format!("allocation {}", reversal.allocation_id))
                })?;
            if state.allocations[index].is_reversed {
                return Err(AllocationError::ReversalConflict(format!(
                    "allocation {} is already reversed",
                    reversal.allocation_id
                )));
            }
            reversal_indexes.push(index);
        }

        let mut updated_invoices = Vec::with_capacity(tx.invoice_updates.len());
        for update in &tx.invoice_updates {
            let current = state
                .invoices
                .get(&key(&tx.tenant_id, &update.invoice_id))
                .ok_or_else(|| AllocationError::NotFound(format!("invoice {}", update.invoice_id)))?;
            updated_invoices.push(apply_invoice_update(current, update)?);
        }

        for allocation in &tx.new_allocations {
            if !state
                .invoices
                .contains_key(&key(&tx.tenant_id, &allocation.invoice_id))
            {
                return Err(AllocationError::NotFound(format!(
                    "invoice {}",
                    allocation.invoice_id
                )));
            }
            if state.allocations.iter().any(|a| a.id == allocation.id) {
                return Err(AllocationError::ContractViolation(format!(
                    "allocation {} already exists",
                    allocation.id
                )));
            }
        }

        let new_balance = match &tx.credit {
            Some(credit) => {
                let current = state
                    .credit_balances
                    .get(&key(&tx.tenant_id, &credit.contact_id))
                    .copied()
                    .unwrap_or(0);
                Some((credit.contact_id.clone(), apply_credit_update(current, credit)?))
            }
            None => None,
        };

        // Apply.
        for (index, reversal) in reversal_indexes.into_iter().zip(&tx.reversals) {
            let allocation = &mut state.allocations[index];
            allocation.is_reversed = true;
            allocation.reversed_at = Some(reversal.reversed_at);
            allocation.reversal_reason = Some(reversal.reason.clone());
        }
        for invoice in updated_invoices {
            state
                .invoices
                .insert(key(&invoice.tenant_id, &invoice.id), invoice);
        }
        if let Some((contact_id, balance)) = new_balance {
            state
                .credit_balances
                .insert(key(&tx.tenant_id, &contact_id), balance);
        }
        if let Some(idempotency_key) = tx.idempotency_key() {
            state
                .idempotency_keys
                .insert(key(&tx.tenant_id, idempotency_key));
        }
        state.allocations.extend(tx.new_allocations);
        state.decisions.push(tx.decision);

        debug!("Ledger transaction committed");
        Ok(())
    }
}
