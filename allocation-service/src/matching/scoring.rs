//! Confidence scoring of candidate matches.

use crate::models::{CandidateMatch, MatchType};

pub const REFERENCE_BASE: f64 = 100.0;
pub const REFERENCE_AMOUNT_MISMATCH_PENALTY: f64 = 10.0;
pub const EXACT_AMOUNT_BASE: f64 = 60.0;
pub const NAME_WEIGHT: f64 = 40.0;
pub const MULTI_EXACT_BASE: f64 = 60.0;
pub const MULTI_TOLERANCE_BASE: f64 = 45.0;
pub const MULTI_PENALTY: f64 = 5.0;
pub const FUZZY_WEIGHT: f64 = 50.0;
pub const FUZZY_CEILING: f64 = 50.0;

const FLOAT_SLACK: f64 = 1e-9;

/// Stateless scorer turning candidate evidence into a 0-100 confidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    pub fn score(&self, candidate: &CandidateMatch) -> u8 {
        let evidence = &candidate.evidence;
        let similarity = evidence.name_similarity.clamp(0.0, 1.0);

        let raw = match candidate.match_type {
            MatchType::Reference => {
                if evidence.amount_matches() {
                    REFERENCE_BASE
                } else {
                    REFERENCE_BASE - REFERENCE_AMOUNT_MISMATCH_PENALTY
                }
            }
            MatchType::ExactAmountName => EXACT_AMOUNT_BASE + similarity * NAME_WEIGHT,
            MatchType::PartialMulti => {
                let base = if evidence.amount_matches() {
                    MULTI_EXACT_BASE
                } else {
                    MULTI_TOLERANCE_BASE
                };
                base + similarity * NAME_WEIGHT - MULTI_PENALTY
            }
            MatchType::FuzzyName => (similarity * FUZZY_WEIGHT).min(FUZZY_CEILING),
            // Credit consumption is never scored as a candidate.
            MatchType::CreditBalance => 0.0,
        };

        (raw + FLOAT_SLACK).floor().clamp(0.0, 100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchEvidence;

    fn candidate(match_type: MatchType, delta: i64, similarity: f64) -> CandidateMatch {
        CandidateMatch {
            invoice_ids: vec!["inv-1".to_string()],
            match_type,
            matched_amount_minor_units: 10_000 + delta,
            evidence: MatchEvidence {
                reference: None,
                amount_delta_minor_units: delta,
                name_similarity: similarity,
                invoice_count: 1,
            },
            confidence: 0,
        }
    }

    #[test]
    fn test_reference_scores() {
        let scorer = ConfidenceScorer;
        assert_eq!(scorer.score(&candidate(MatchType::Reference, 0, 0.0)), 100);
        assert_eq!(scorer.score(&candidate(MatchType::Reference, -2_000, 1.0)), 90);
    }

    #[test]
    fn test_exact_amount_name_scores() {
        let scorer = ConfidenceScorer;
        assert_eq!(scorer.score(&candidate(MatchType::ExactAmountName, 0, 1.0)), 100);
        assert_eq!(scorer.score(&candidate(MatchType::ExactAmountName, 0, 0.75)), 90);
        assert_eq!(scorer.score(&candidate(MatchType::ExactAmountName, 0, 0.7)), 88);
    }

    #[test]
    fn test_partial_multi_scores() {
        let scorer = ConfidenceScorer;
        assert_eq!(scorer.score(&candidate(MatchType::PartialMulti, 0, 1.0)), 95);
        assert_eq!(scorer.score(&candidate(MatchType::PartialMulti, 0, 0.5)), 75);
        assert_eq!(scorer.score(&candidate(MatchType::PartialMulti, 50, 1.0)), 80);
    }

    #[test]
    fn test_fuzzy_is_floored_and_capped() {
        let scorer = ConfidenceScorer;
        assert_eq!(scorer.score(&candidate(MatchType::FuzzyName, 0, 0.65)), 32);
        assert_eq!(scorer.score(&candidate(MatchType::FuzzyName, 0, 1.0)), 50);
        assert_eq!(scorer.score(&candidate(MatchType::FuzzyName, 0, 1.5)), 50);
    }
}
