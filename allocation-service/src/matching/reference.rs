//! Invoice reference extraction from free-text payment descriptions.

use once_cell::sync::Lazy;
use regex::Regex;

/// `INV-2024-0042`, `INV/2024/42`, `inv 2024_0042`.
static YEAR_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bINV\s*[-/_ ]\s*(20\d{2})\s*[-/_ ]\s*(\d{1,6})\b").expect("valid regex")
});

/// `INV1001`, `INV-1001`, `INVOICE NO. 1001`, `INVOICE #1001`.
static INVOICE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bINV(?:OICE)?\s*(?:NO\.?|NUMBER|NUM)?[\s#:._-]*(\d{3,10})\b")
        .expect("valid regex")
});

/// Any standalone 4-10 digit token.
static NUMERIC_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4,10})\b").expect("valid regex"));

/// Extract the canonical invoice reference from free text.
///
/// Patterns are tried in priority order; a higher-priority pattern wins even
/// when a lower one matches earlier in the text.
pub fn extract(text: &str) -> Option<String> {
    let upper = text.to_uppercase();

    if let Some(caps) = YEAR_SEQUENCE.captures(&upper) {
        return Some(format!("INV-{}-{}", &caps[1], pad_sequence(&caps[2])));
    }
    if let Some(caps) = INVOICE_NUMBER.captures(&upper) {
        return Some(format!("INV-{}", &caps[1]));
    }
    NUMERIC_TOKEN
        .captures(&upper)
        .map(|caps| caps[1].to_string())
}

/// Canonical form of an invoice number, comparable with [`extract`] output.
pub fn canonical_invoice_number(invoice_number: &str) -> String {
    extract(invoice_number).unwrap_or_else(|| invoice_number.trim().to_uppercase())
}

/// Reference for a payment: description first, then the bank's own reference.
pub fn payment_reference(description: &str, external_reference: Option<&str>) -> Option<String> {
    extract(description).or_else(|| external_reference.and_then(extract))
}

fn pad_sequence(seq: &str) -> String {
    format!("{:0>4}", seq)
}
