//! Human review queue for payments the engine would not auto-apply.

use crate::error::AllocationError;
use crate::models::{EscalationStatus, EscalationTicket};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait EscalationQueue: Send + Sync {
    /// Enqueue a ticket. A pending ticket for the same payment is replaced.
    async fn push(&self, ticket: EscalationTicket) -> Result<(), AllocationError>;

    /// Pending tickets of a tenant, oldest first.
    async fn pending(&self, tenant_id: &str) -> Result<Vec<EscalationTicket>, AllocationError>;

    /// Mark the payment's pending ticket resolved. Returns false if there was none.
    async fn resolve(&self, tenant_id: &str, payment_id: &str) -> Result<bool, AllocationError>;
}

#[derive(Debug, Default)]
pub struct InMemoryEscalationQueue {
    tickets: RwLock<Vec<EscalationTicket>>,
}

impl InMemoryEscalationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ticket ever pushed for a tenant, resolved ones included.
    pub async fn all(&self, tenant_id: &str) -> Vec<EscalationTicket> {
        self.tickets
            .read()
            .await
            .iter()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

fn is_pending_for(ticket: &EscalationTicket, tenant_id: &str, payment_id: &str) -> bool {
    ticket.status == EscalationStatus::Pending
        && ticket.tenant_id == tenant_id
        && ticket.payment.id == payment_id
}

#[async_trait]
impl EscalationQueue for InMemoryEscalationQueue {
    async fn push(&self, ticket: EscalationTicket) -> Result<(), AllocationError> {
        let mut tickets = self.tickets.write().await;
        info!(
            tenant_id = %ticket.tenant_id,
            payment_id = %ticket.payment.id,
            reason = ticket.reason.as_str(),
            "Payment escalated for review"
        );
        match tickets
            .iter_mut()
            .find(|t| is_pending_for(t, &ticket.tenant_id, &ticket.payment.id))
        {
            Some(existing) => *existing = ticket,
            None => tickets.push(ticket),
        }
        Ok(())
    }

    async fn pending(&self, tenant_id: &str) -> Result<Vec<EscalationTicket>, AllocationError> {
        let tickets = self.tickets.read().await;
        let mut pending: Vec<EscalationTicket> = tickets
            .iter()
            .filter(|t| t.tenant_id == tenant_id && t.status == EscalationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }

    async fn resolve(&self, tenant_id: &str, payment_id: &str) -> Result<bool, AllocationError> {
        let mut tickets = self.tickets.write().await;
        let mut resolved = false;
        for ticket in tickets
            .iter_mut()
            .filter(|t| is_pending_for(t, tenant_id, payment_id))
        {
            ticket.status = EscalationStatus::Resolved;
            ticket.resolved_at = Some(Utc::now());
            resolved = true;
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EscalationReason, IncomingPayment};
    use chrono::NaiveDate;

    fn payment(id: &str) -> IncomingPayment {
        IncomingPayment {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            contact_id: Some("c1".to_string()),
            amount_minor_units: 1_000,
            payee_name_raw: "Jane Smith".to_string(),
            description_raw: String::new(),
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            external_reference: None,
        }
    }

    #[tokio::test]
    async fn push_replaces_pending_ticket_of_same_payment() {
        let queue = InMemoryEscalationQueue::new();
        queue
            .push(EscalationTicket::new(&payment("p1"), EscalationReason::NoCandidates, "first"))
            .await
            .unwrap();
        queue
            .push(EscalationTicket::new(&payment("p1"), EscalationReason::LowConfidence, "second"))
            .await
            .unwrap();

        let pending = queue.pending("t1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].reason, EscalationReason::LowConfidence);
    }

    #[tokio::test]
    async fn resolve_removes_from_pending() {
        let queue = InMemoryEscalationQueue::new();
        queue
            .push(EscalationTicket::new(&payment("p1"), EscalationReason::NoCandidates, ""))
            .await
            .unwrap();

        assert!(queue.resolve("t1", "p1").await.unwrap());
        assert!(!queue.resolve("t1", "p1").await.unwrap());
        assert!(queue.pending("t1").await.unwrap().is_empty());
        assert_eq!(queue.all("t1").await.len(), 1);
    }
}
