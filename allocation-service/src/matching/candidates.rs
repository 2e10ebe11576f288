//! Candidate generation: every strategy proposes invoice sets for a payment.

use crate::config::MatchingConfig;
use crate::matching::normalize::similarity;
use crate::matching::reference::{canonical_invoice_number, payment_reference};
use crate::matching::scoring::ConfidenceScorer;
use crate::models::{CandidateMatch, IncomingPayment, Invoice, MatchEvidence, MatchType};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Matching strategies, run in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Reference,
    ExactAmountName,
    PartialMulti,
    FuzzyName,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Reference,
        Strategy::ExactAmountName,
        Strategy::PartialMulti,
        Strategy::FuzzyName,
    ];

    pub fn match_type(&self) -> MatchType {
        match self {
            Strategy::Reference => MatchType::Reference,
            Strategy::ExactAmountName => MatchType::ExactAmountName,
            Strategy::PartialMulti => MatchType::PartialMulti,
            Strategy::FuzzyName => MatchType::FuzzyName,
        }
    }

    /// Unscored candidates proposed by this strategy.
    pub fn propose(&self, ctx: &MatchContext<'_>, config: &MatchingConfig) -> Vec<CandidateMatch> {
        match self {
            Strategy::Reference => {
                let Some(reference) = ctx.reference.as_deref() else {
                    return Vec::new();
                };
                ctx.invoices
                    .iter()
                    .enumerate()
                    .filter(|(_, inv)| canonical_invoice_number(&inv.invoice_number) == reference)
                    .map(|(i, _)| ctx.single(i, MatchType::Reference))
                    .collect()
            }
            Strategy::ExactAmountName => ctx
                .invoices
                .iter()
                .enumerate()
                .filter(|(i, inv)| {
                    inv.amount_due_minor_units == ctx.payment.amount_minor_units
                        && ctx.similarities[*i] >= config.exact_name_threshold
                })
                .map(|(i, _)| ctx.single(i, MatchType::ExactAmountName))
                .collect(),
            Strategy::PartialMulti => partial_multi(ctx, config),
            Strategy::FuzzyName => ctx
                .invoices
                .iter()
                .enumerate()
                .filter(|(i, _)| ctx.similarities[*i] >= config.fuzzy_name_threshold)
                .map(|(i, _)| ctx.single(i, MatchType::FuzzyName))
                .collect(),
        }
    }
}

/// Inputs shared by all strategies for one payment.
pub struct MatchContext<'a> {
    pub payment: &'a IncomingPayment,
    /// Eligible invoices in invoice order.
    pub invoices: Vec<&'a Invoice>,
    /// Payee vs. contact name similarity, aligned with `invoices`.
    pub similarities: Vec<f64>,
    pub reference: Option<String>,
}

impl<'a> MatchContext<'a> {
    pub fn new(payment: &'a IncomingPayment, invoices: &'a [Invoice]) -> Self {
        let mut eligible: Vec<&Invoice> = invoices
            .iter()
            .filter(|inv| inv.tenant_id == payment.tenant_id)
            .filter(|inv| match &payment.contact_id {
                Some(contact_id) => &inv.contact_id == contact_id,
                None => true,
            })
            .filter(|inv| inv.is_open())
            .filter(|inv| match inv.check_consistency() {
                Ok(()) => true,
                Err(e) => {
                    warn!(invoice_id = %inv.id, error = %e, "Skipping inconsistent invoice");
                    false
                }
            })
            .collect();
        eligible.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let similarities = eligible
            .iter()
            .map(|inv| similarity(&payment.payee_name_raw, &inv.contact_name))
            .collect();
        let reference = payment_reference(
            &payment.description_raw,
            payment.external_reference.as_deref(),
        );

        Self {
            payment,
            invoices: eligible,
            similarities,
            reference,
        }
    }

    fn single(&self, index: usize, match_type: MatchType) -> CandidateMatch {
        self.combination(&[index], match_type)
    }

    /// Candidate over `indices`, which must be ascending (invoice order).
    fn combination(&self, indices: &[usize], match_type: MatchType) -> CandidateMatch {
        let matched: i64 = indices
            .iter()
            .map(|&i| self.invoices[i].amount_due_minor_units)
            .sum();
        let name_similarity =
            indices.iter().map(|&i| self.similarities[i]).sum::<f64>() / indices.len() as f64;

        CandidateMatch {
            invoice_ids: indices.iter().map(|&i| self.invoices[i].id.clone()).collect(),
            match_type,
            matched_amount_minor_units: matched,
            evidence: MatchEvidence {
                reference: match match_type {
                    MatchType::Reference => self.reference.clone(),
                    _ => None,
                },
                amount_delta_minor_units: matched - self.payment.amount_minor_units,
                name_similarity,
                invoice_count: indices.len(),
            },
            confidence: 0,
        }
    }
}

/// Depth-first subset-sum search over a bounded pool.
struct SubsetSearch<'p> {
    amounts: &'p [i64],
    target: i64,
    tolerance: i64,
    max_size: usize,
    stack: Vec<usize>,
    found: Vec<Vec<usize>>,
}

impl SubsetSearch<'_> {
    fn run(&mut self, start: usize, sum: i64) {
        for i in start..self.amounts.len() {
            let next = sum + self.amounts[i];
            // Amounts are positive: nothing below can bring the sum back.
            if next > self.target + self.tolerance {
                continue;
            }
            self.stack.push(i);
            if self.stack.len() >= 2 && (next - self.target).abs() <= self.tolerance {
                self.found.push(self.stack.clone());
            }
            if self.stack.len() < self.max_size {
                self.run(i + 1, next);
            }
            self.stack.pop();
        }
    }
}

fn partial_multi(ctx: &MatchContext<'_>, config: &MatchingConfig) -> Vec<CandidateMatch> {
    if config.max_combination_size < 2 || ctx.invoices.len() < 2 {
        return Vec::new();
    }

    // Most recent invoices form the pool, searched in invoice order.
    let mut pool: Vec<usize> = (0..ctx.invoices.len()).collect();
    pool.sort_by(|&a, &b| ctx.invoices[b].order_key().cmp(&ctx.invoices[a].order_key()));
    pool.truncate(config.subset_pool_size);
    pool.sort_unstable();

    let amounts: Vec<i64> = pool
        .iter()
        .map(|&i| ctx.invoices[i].amount_due_minor_units)
        .collect();
    let mut search = SubsetSearch {
        amounts: &amounts,
        target: ctx.payment.amount_minor_units,
        tolerance: config.amount_tolerance_minor_units,
        max_size: config.max_combination_size,
        stack: Vec::with_capacity(config.max_combination_size),
        found: Vec::new(),
    };
    search.run(0, 0);

    let mut combinations: Vec<(i64, Vec<usize>)> = search
        .found
        .into_iter()
        .map(|positions| {
            let indices: Vec<usize> = positions.into_iter().map(|p| pool[p]).collect();
            let sum: i64 = indices
                .iter()
                .map(|&i| ctx.invoices[i].amount_due_minor_units)
                .sum();
            ((sum - ctx.payment.amount_minor_units).abs(), indices)
        })
        .collect();
    // Closest sum, then fewer invoices, then older invoices.
    combinations.sort_by(|(da, a), (db, b)| {
        da.cmp(db).then(a.len().cmp(&b.len())).then(a.cmp(b))
    });

    debug!(
        pool = pool.len(),
        matches = combinations.len(),
        "Subset search finished"
    );

    combinations
        .into_iter()
        .take(config.max_subset_candidates)
        .map(|(_, indices)| ctx.combination(&indices, MatchType::PartialMulti))
        .collect()
}

/// Runs every strategy, scores and merges their proposals.
#[derive(Debug, Clone, Default)]
pub struct CandidateGenerator {
    config: MatchingConfig,
    scorer: ConfidenceScorer,
}

impl CandidateGenerator {
    pub fn new(config: MatchingConfig) -> Self {
        Self {
            config,
            scorer: ConfidenceScorer,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Scored candidates, best first.
    pub fn generate(&self, payment: &IncomingPayment, invoices: &[Invoice]) -> Vec<CandidateMatch> {
        let ctx = MatchContext::new(payment, invoices);
        if ctx.invoices.is_empty() {
            return Vec::new();
        }

        let mut best: HashMap<Vec<String>, CandidateMatch> = HashMap::new();
        for strategy in Strategy::ALL {
            for mut candidate in strategy.propose(&ctx, &self.config) {
                candidate.confidence = self.scorer.score(&candidate);
                let key = candidate.invoice_set_key();
                let replace = best
                    .get(&key)
                    .map_or(true, |existing| outranks(&candidate, existing));
                if replace {
                    best.insert(key, candidate);
                }
            }
        }

        let position: HashMap<&str, usize> = ctx
            .invoices
            .iter()
            .enumerate()
            .map(|(i, inv)| (inv.id.as_str(), i))
            .collect();
        let invoice_positions = |c: &CandidateMatch| -> Vec<usize> {
            c.invoice_ids
                .iter()
                .map(|id| position.get(id.as_str()).copied().unwrap_or(usize::MAX))
                .collect()
        };

        let mut candidates: Vec<CandidateMatch> = best.into_values().collect();
        candidates.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then(a.match_type.precedence().cmp(&b.match_type.precedence()))
                .then_with(|| invoice_positions(a).cmp(&invoice_positions(b)))
        });
        candidates
    }
}

/// Higher confidence wins; equal confidence goes to the stronger strategy.
fn outranks(candidate: &CandidateMatch, existing: &CandidateMatch) -> bool {
    match candidate.confidence.cmp(&existing.confidence) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.match_type.precedence() < existing.match_type.precedence(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceStatus;
    use chrono::NaiveDate;

    fn payment(amount: i64, payee: &str, description: &str) -> IncomingPayment {
        IncomingPayment {
            id: "pay-1".to_string(),
            tenant_id: "t1".to_string(),
            contact_id: Some("c1".to_string()),
            amount_minor_units: amount,
            payee_name_raw: payee.to_string(),
            description_raw: description.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            external_reference: None,
        }
    }

    fn invoice(id: &str, number: &str, due: i64, name: &str, day: u32) -> Invoice {
        Invoice {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            contact_id: "c1".to_string(),
            invoice_number: number.to_string(),
            total_minor_units: due,
            amount_due_minor_units: due,
            contact_name: name.to_string(),
            status: InvoiceStatus::Open,
            issue_date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
        }
    }

    #[test]
    fn test_reference_match_ranks_first() {
        let generator = CandidateGenerator::default();
        let invoices = vec![
            invoice("a", "INV-1001", 10_000, "Jane Smith", 1),
            invoice("b", "INV-1002", 10_000, "Jane Smith", 2),
        ];
        let candidates = generator.generate(&payment(10_000, "J Smith", "INV-1002 fees"), &invoices);

        let best = &candidates[0];
        assert_eq!(best.match_type, MatchType::Reference);
        assert_eq!(best.invoice_ids, vec!["b".to_string()]);
        assert_eq!(best.confidence, 100);
        assert_eq!(best.evidence.reference.as_deref(), Some("INV-1002"));
    }

    #[test]
    fn test_duplicate_invoice_sets_keep_best_variant() {
        let generator = CandidateGenerator::default();
        let invoices = vec![invoice("a", "INV-1001", 10_000, "Jane Smith", 1)];
        let candidates = generator.generate(&payment(10_000, "Jane Smith", "INV-1001"), &invoices);

        // Reference, exact-amount and fuzzy all propose {a}.
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].match_type, MatchType::Reference);
    }

    #[test]
    fn test_equal_confidence_prefers_stronger_strategy() {
        let generator = CandidateGenerator::default();
        let invoices = vec![invoice("a", "X-1", 10_000, "Jane Smith", 1)];
        let candidates = generator.generate(&payment(10_000, "Jane Smith", "fees"), &invoices);

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].match_type, MatchType::ExactAmountName);
        assert_eq!(candidates[0].confidence, 100);
    }

    #[test]
    fn test_ignores_closed_and_foreign_invoices() {
        let generator = CandidateGenerator::default();
        let mut paid = invoice("paid", "INV-1001", 10_000, "Jane Smith", 1);
        paid.amount_due_minor_units = 0;
        paid.status = InvoiceStatus::Paid;
        let mut void = invoice("void", "INV-1001", 10_000, "Jane Smith", 2);
        void.status = InvoiceStatus::Void;
        let mut other_contact = invoice("other", "INV-1001", 10_000, "Jane Smith", 3);
        other_contact.contact_id = "c2".to_string();
        let mut other_tenant = invoice("tenant", "INV-1001", 10_000, "Jane Smith", 4);
        other_tenant.tenant_id = "t2".to_string();

        let candidates = generator.generate(
            &payment(10_000, "Jane Smith", "INV-1001"),
            &[paid, void, other_contact, other_tenant],
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_subset_finds_five_invoice_combination() {
        let generator = CandidateGenerator::default();
        let invoices: Vec<Invoice> = [1_000, 1_100, 1_200, 1_300, 1_700]
            .iter()
            .enumerate()
            .map(|(i, &due)| {
                invoice(&format!("i{i}"), &format!("X-{i}"), due, "Jane Smith", i as u32 + 1)
            })
            .collect();
        let candidates = generator.generate(&payment(6_300, "Jane Smith", ""), &invoices);

        let multi: Vec<_> = candidates
            .iter()
            .filter(|c| c.match_type == MatchType::PartialMulti)
            .collect();
        assert_eq!(multi.len(), 1);
        assert_eq!(multi[0].invoice_ids.len(), 5);
        assert_eq!(multi[0].matched_amount_minor_units, 6_300);
        assert_eq!(multi[0].confidence, 95);
    }

    #[test]
    fn test_subset_ignores_six_invoice_combination() {
        let generator = CandidateGenerator::default();
        let invoices: Vec<Invoice> = [1_000, 1_100, 1_200, 1_300, 1_400, 1_500]
            .iter()
            .enumerate()
            .map(|(i, &due)| {
                invoice(&format!("i{i}"), &format!("X-{i}"), due, "Jane Smith", i as u32 + 1)
            })
            .collect();
        let candidates = generator.generate(&payment(7_500, "Jane Smith", ""), &invoices);

        assert!(candidates
            .iter()
            .all(|c| c.match_type != MatchType::PartialMulti));
    }

    #[test]
    fn test_subset_ranking_prefers_fewer_invoices() {
        let generator = CandidateGenerator::default();
        let invoices = vec![
            invoice("a", "X-1", 1_000, "Jane Smith", 1),
            invoice("b", "X-2", 2_000, "Jane Smith", 2),
            invoice("c", "X-3", 3_000, "Jane Smith", 3),
        ];
        let candidates = generator.generate(&payment(3_000, "Peter Brown", ""), &invoices);

        // {a, b} is the only multi-invoice set; {c} is a single invoice.
        let multi: Vec<_> = candidates
            .iter()
            .filter(|c| c.match_type == MatchType::PartialMulti)
            .collect();
        assert_eq!(multi.len(), 1);
        assert_eq!(multi[0].invoice_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_subset_tolerance_and_cap() {
        let config = MatchingConfig {
            amount_tolerance_minor_units: 100,
            max_subset_candidates: 2,
            ..MatchingConfig::default()
        };
        let generator = CandidateGenerator::new(config);
        let invoices = vec![
            invoice("a", "X-1", 1_000, "Jane Smith", 1),
            invoice("b", "X-2", 1_050, "Jane Smith", 2),
            invoice("c", "X-3", 1_950, "Jane Smith", 3),
            invoice("d", "X-4", 2_000, "Jane Smith", 4),
        ];
        let candidates = generator.generate(&payment(3_000, "Jane Smith", ""), &invoices);
        let multi: Vec<_> = candidates
            .iter()
            .filter(|c| c.match_type == MatchType::PartialMulti)
            .collect();

        assert_eq!(multi.len(), 2);
        // Exact sums outrank the ones that are only within tolerance.
        assert_eq!(multi[0].evidence.amount_delta_minor_units, 0);
        assert_eq!(multi[1].evidence.amount_delta_minor_units, 0);
        assert_eq!(multi[0].invoice_ids, vec!["a".to_string(), "d".to_string()]);
        assert_eq!(multi[1].invoice_ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_fuzzy_candidates_ignore_amount() {
        let generator = CandidateGenerator::default();
        let invoices = vec![invoice("a", "X-1", 45_000, "Jane Smith", 1)];
        let candidates = generator.generate(&payment(10_000, "Jane Smyth", ""), &invoices);

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].match_type, MatchType::FuzzyName);
        assert_eq!(candidates[0].confidence, 46);
        assert_eq!(candidates[0].evidence.amount_delta_minor_units, 35_000);
    }

    #[test]
    fn test_sorted_by_confidence() {
        let generator = CandidateGenerator::default();
        let invoices = vec![
            invoice("a", "X-1", 5_000, "Jane Smith", 1),
            invoice("b", "X-2", 5_000, "Jane Smith", 2),
            invoice("c", "X-3", 10_000, "Jane Smith", 3),
        ];
        let candidates = generator.generate(&payment(10_000, "Jane Smith", ""), &invoices);
        let confidences: Vec<u8> = candidates.iter().map(|c| c.confidence).collect();
        let mut sorted = confidences.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(confidences, sorted);
        assert_eq!(candidates[0].invoice_ids, vec!["c".to_string()]);
    }
}
