//! Domain models for allocation-service.

pub mod allocation;
pub mod decision;
pub mod escalation;
pub mod invoice;
pub mod payment;

pub use allocation::{Allocation, CreditBalance, CreditSource, MatchType, MatchedBy};
pub use decision::{
    CandidateMatch, DecisionLogEntry, DecisionOutcome, MatchEvidence, PaymentState,
};
pub use escalation::{
    EscalationReason, EscalationStatus, EscalationTicket, ManualAllocationLine, ManualDecision,
};
pub use invoice::{Invoice, InvoiceStatus};
pub use payment::IncomingPayment;
