//! Pure matching pipeline: normalization, reference extraction, candidate
//! generation and scoring. Nothing in here touches the ledger.

pub mod candidates;
pub mod normalize;
pub mod reference;
pub mod scoring;

pub use candidates::{CandidateGenerator, MatchContext, Strategy};
pub use normalize::{normalize, similarity};
pub use reference::{canonical_invoice_number, extract, payment_reference};
pub use scoring::ConfidenceScorer;
