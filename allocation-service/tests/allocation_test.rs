//! Payment allocation integration tests against the in-memory ledger.

mod common;

use allocation_service::error::AllocationError;
use allocation_service::models::{
    DecisionOutcome, EscalationReason, InvoiceStatus, MatchType, MatchedBy, PaymentState,
};
use common::{harness, invoice, payment, CONTACT, TENANT};

#[tokio::test]
async fn reference_match_pays_invoice_in_full() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 10_000, "Jane Smith", "School fees INV-1001"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::AutoApplied);
    let chosen = result.chosen.as_ref().unwrap();
    assert_eq!(chosen.match_type, MatchType::Reference);
    assert_eq!(chosen.confidence, 100);
    assert_eq!(result.allocations.len(), 1);
    assert_eq!(result.allocations[0].amount_minor_units, 10_000);
    assert_eq!(result.allocations[0].matched_by, MatchedBy::Auto);
    assert_eq!(result.credited_minor_units, 0);

    let inv = h.invoice("inv-1").await;
    assert_eq!(inv.amount_due_minor_units, 0);
    assert_eq!(inv.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn payment_covering_two_invoices_pays_both() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;
    let mut second = invoice("inv-2", "INV-1002", 5_000, "Jane Smith");
    second.issue_date = common::date(2, 15);
    h.add_invoice(second).await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 15_000, "Jane Smith", "fees"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::AutoApplied);
    let chosen = result.chosen.as_ref().unwrap();
    assert_eq!(chosen.match_type, MatchType::PartialMulti);
    assert!(chosen.confidence >= 90);
    assert_eq!(chosen.invoice_ids, vec!["inv-1", "inv-2"]);
    assert_eq!(result.allocations.len(), 2);

    assert_eq!(h.invoice("inv-1").await.amount_due_minor_units, 0);
    assert_eq!(h.invoice("inv-2").await.amount_due_minor_units, 0);
}

#[tokio::test]
async fn overpayment_is_credited_to_contact() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 12_000, "Jane Smyth", "INV-1001"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::AutoApplied);
    assert_eq!(result.chosen.as_ref().unwrap().confidence, 90);
    assert_eq!(result.credited_minor_units, 2_000);
    assert_eq!(result.allocations.len(), 1);
    assert_eq!(result.allocations[0].amount_minor_units, 10_000);
    assert_eq!(result.allocations[0].credit_delta_minor_units, 2_000);

    let inv = h.invoice("inv-1").await;
    assert_eq!(inv.amount_due_minor_units, 0);
    assert_eq!(h.credit_balance(CONTACT).await, 2_000);
}

#[tokio::test]
async fn weak_fuzzy_match_is_escalated_without_touching_ledger() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 8_000, "Janet Smit", "monthly"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::Escalated);
    assert_eq!(result.escalation_reason, Some(EscalationReason::LowConfidence));
    assert!(result.allocations.is_empty());
    assert_eq!(result.candidates.len(), 1);
    assert_eq!(result.candidates[0].match_type, MatchType::FuzzyName);
    assert_eq!(result.candidates[0].confidence, 32);

    assert_eq!(h.invoice("inv-1").await.amount_due_minor_units, 10_000);
    assert!(h.ledger.allocations(TENANT).await.is_empty());
    let decisions = h.ledger.decisions(TENANT).await;
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].outcome, DecisionOutcome::Escalated);

    let pending = h.escalations.all(TENANT).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payment.id, "pay-1");
    assert_eq!(pending[0].decision_id, Some(decisions[0].id));
}

#[tokio::test]
async fn reversal_restores_invoice_and_cannot_repeat() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;
    let result = h
        .engine
        .process_payment(&payment("pay-1", 10_000, "Jane Smith", "INV-1001"))
        .await
        .unwrap();
    let allocation_id = result.allocations[0].id;

    let reversal = h
        .reversals
        .reverse(TENANT, allocation_id, "bounced payment")
        .await
        .unwrap();
    assert!(reversal.allocation.is_reversed);
    assert_eq!(reversal.invoice.amount_due_minor_units, 10_000);
    assert_eq!(reversal.invoice.status, InvoiceStatus::Open);

    let inv = h.invoice("inv-1").await;
    assert_eq!(inv.amount_due_minor_units, 10_000);
    let stored = h.ledger.allocations(TENANT).await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_reversed);
    assert_eq!(stored[0].reversal_reason.as_deref(), Some("bounced payment"));

    let again = h.reversals.reverse(TENANT, allocation_id, "again").await;
    assert!(matches!(again, Err(AllocationError::ReversalConflict(_))));

    let outcomes: Vec<DecisionOutcome> = h
        .ledger
        .decisions(TENANT)
        .await
        .iter()
        .map(|d| d.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![DecisionOutcome::AutoApplied, DecisionOutcome::Reversed]
    );
}

#[tokio::test]
async fn reversal_requires_reason_and_known_allocation() {
    let h = harness();
    let missing = h
        .reversals
        .reverse(TENANT, uuid::Uuid::new_v4(), "duplicate")
        .await;
    assert!(matches!(missing, Err(AllocationError::NotFound(_))));

    let blank = h.reversals.reverse(TENANT, uuid::Uuid::new_v4(), "  ").await;
    assert!(matches!(blank, Err(AllocationError::ValidationError(_))));
}

#[tokio::test]
async fn payment_without_candidates_is_escalated() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 3_000, "Peter Brown", "transfer"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::Escalated);
    assert_eq!(result.escalation_reason, Some(EscalationReason::NoCandidates));
    assert!(result.candidates.is_empty());
}

#[tokio::test]
async fn payment_without_contact_is_escalated() {
    let h = harness();
    let mut p = payment("pay-1", 3_000, "Peter Brown", "INV-1001");
    p.contact_id = None;

    let result = h.engine.process_payment(&p).await.unwrap();

    assert_eq!(result.state, PaymentState::Escalated);
    assert_eq!(result.escalation_reason, Some(EscalationReason::NoContact));
    assert_eq!(h.escalations.all(TENANT).await.len(), 1);
}

#[tokio::test]
async fn equal_best_candidates_are_ambiguous() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 5_000, "Jane Smith"))
        .await;
    let mut second = invoice("inv-2", "INV-1002", 5_000, "Jane Smith");
    second.issue_date = common::date(2, 15);
    h.add_invoice(second).await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 5_000, "Jane Smith", "fees"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::Escalated);
    assert_eq!(result.escalation_reason, Some(EscalationReason::AmbiguousMatch));
    assert_eq!(result.candidates[0].confidence, 100);
    assert_eq!(result.candidates[1].confidence, 100);
    assert_eq!(h.invoice("inv-1").await.amount_due_minor_units, 5_000);
    assert_eq!(h.invoice("inv-2").await.amount_due_minor_units, 5_000);
}

#[tokio::test]
async fn quoted_reference_wins_over_same_amount_sibling_invoice() {
    let h = harness();
    h.add_invoice(invoice("jan", "INV-1001", 10_000, "Jane Smith"))
        .await;
    let mut feb = invoice("feb", "INV-1002", 10_000, "Jane Smith");
    feb.issue_date = common::date(2, 1);
    h.add_invoice(feb).await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 10_000, "Jane Smith", "Fees INV-1002"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::AutoApplied);
    assert_eq!(result.escalation_reason, None);
    let chosen = result.chosen.as_ref().unwrap();
    assert_eq!(chosen.match_type, MatchType::Reference);
    assert_eq!(chosen.invoice_ids, vec!["feb".to_string()]);
    assert_eq!(result.candidates[1].match_type, MatchType::ExactAmountName);
    assert_eq!(result.candidates[1].confidence, 100);

    let feb = h.invoice("feb").await;
    assert_eq!(feb.amount_due_minor_units, 0);
    assert_eq!(feb.status, InvoiceStatus::Paid);
    let jan = h.invoice("jan").await;
    assert_eq!(jan.amount_due_minor_units, 10_000);
    assert_eq!(jan.status, InvoiceStatus::Open);
}

#[tokio::test]
async fn invalid_payment_is_rejected() {
    let h = harness();
    let p = payment("pay-1", 0, "Jane Smith", "INV-1001");

    let result = h.engine.process_payment(&p).await;

    assert!(matches!(result, Err(AllocationError::ValidationError(_))));
    assert!(h.ledger.decisions(TENANT).await.is_empty());
}

#[tokio::test]
async fn invoices_of_other_tenants_are_never_matched() {
    let h = harness();
    let mut foreign = invoice("inv-1", "INV-1001", 10_000, "Jane Smith");
    foreign.tenant_id = "tenant-2".to_string();
    h.add_invoice(foreign).await;

    let result = h
        .engine
        .process_payment(&payment("pay-1", 10_000, "Jane Smith", "INV-1001"))
        .await
        .unwrap();

    assert_eq!(result.state, PaymentState::Escalated);
    assert_eq!(result.escalation_reason, Some(EscalationReason::NoCandidates));
}
