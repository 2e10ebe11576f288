//! Services module for allocation-service.

pub mod database;
pub mod engine;
pub mod escalation;
pub mod ledger;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod reversal;

pub use database::Database;
pub use engine::{AllocationEngine, AllocationResult, BatchItem, CreditApplication};
pub use escalation::{EscalationQueue, InMemoryEscalationQueue};
pub use ledger::{LedgerStore, LedgerTransaction, PaymentGuard};
pub use locks::ContactLocks;
pub use memory::InMemoryLedger;
pub use metrics::{get_metrics, init_metrics, record_error, record_http_request};
pub use reversal::{ReversalManager, ReversalResult};
