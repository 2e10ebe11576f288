//! Common test utilities for allocation-service integration tests.

#![allow(dead_code)]

use allocation_service::config::MatchingConfig;
use allocation_service::models::{IncomingPayment, Invoice, InvoiceStatus};
use allocation_service::services::{
    AllocationEngine, ContactLocks, InMemoryEscalationQueue, InMemoryLedger, ReversalManager,
};
use allocation_service::startup::AppState;
use chrono::NaiveDate;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

pub const TENANT: &str = "tenant-1";
pub const CONTACT: &str = "contact-1";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,allocation_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Engine, reversal manager and the in-memory stores behind them.
pub struct TestHarness {
    pub ledger: Arc<InMemoryLedger>,
    pub escalations: Arc<InMemoryEscalationQueue>,
    pub engine: Arc<AllocationEngine>,
    pub reversals: Arc<ReversalManager>,
}

pub fn harness() -> TestHarness {
    harness_with(MatchingConfig::default())
}

pub fn harness_with(config: MatchingConfig) -> TestHarness {
    init_tracing();

    let ledger = Arc::new(InMemoryLedger::new());
    let escalations = Arc::new(InMemoryEscalationQueue::new());
    let locks = Arc::new(ContactLocks::new());
    let reversals = Arc::new(ReversalManager::new(
        ledger.clone(),
        locks.clone(),
        config.max_commit_retries,
    ));
    let engine = Arc::new(AllocationEngine::new(
        ledger.clone(),
        escalations.clone(),
        locks,
        config,
    ));

    TestHarness {
        ledger,
        escalations,
        engine,
        reversals,
    }
}

impl TestHarness {
    pub async fn add_invoice(&self, invoice: Invoice) {
        self.ledger
            .upsert_invoice(invoice)
            .await
            .expect("Failed to insert invoice");
    }

    pub async fn invoice(&self, invoice_id: &str) -> Invoice {
        self.ledger
            .invoices(TENANT)
            .await
            .into_iter()
            .find(|inv| inv.id == invoice_id)
            .expect("invoice should exist")
    }

    pub async fn credit_balance(&self, contact_id: &str) -> i64 {
        use allocation_service::services::LedgerStore;
        self.ledger
            .get_credit_balance(TENANT, contact_id)
            .await
            .expect("Failed to read credit balance")
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.ledger.clone(),
            self.escalations.clone(),
            self.engine.config().clone(),
        )
    }
}

pub fn date(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, month, day).expect("valid date")
}

/// An open invoice for the default contact.
pub fn invoice(id: &str, number: &str, amount_due: i64, contact_name: &str) -> Invoice {
    Invoice {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        contact_id: CONTACT.to_string(),
        invoice_number: number.to_string(),
        total_minor_units: amount_due,
        amount_due_minor_units: amount_due,
        contact_name: contact_name.to_string(),
        status: InvoiceStatus::Open,
        issue_date: date(1, 15),
    }
}

pub fn payment(id: &str, amount: i64, payee: &str, description: &str) -> IncomingPayment {
    IncomingPayment {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        contact_id: Some(CONTACT.to_string()),
        amount_minor_units: amount,
        payee_name_raw: payee.to_string(),
        description_raw: description.to_string(),
        date: date(3, 1),
        external_reference: None,
    }
}
