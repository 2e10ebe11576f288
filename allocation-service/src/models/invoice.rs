//! Invoice model, as read from and written back to the invoice ledger.

use crate::error::AllocationError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Open,
    PartiallyPaid,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "open",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(InvoiceStatus::Open),
            "partially_paid" => Some(InvoiceStatus::PartiallyPaid),
            "paid" => Some(InvoiceStatus::Paid),
            "void" => Some(InvoiceStatus::Void),
            _ => None,
        }
    }

    /// Status implied by an amount due. VOID is sticky.
    pub fn recompute(self, total_minor_units: i64, amount_due_minor_units: i64) -> Self {
        if self == InvoiceStatus::Void {
            InvoiceStatus::Void
        } else if amount_due_minor_units == 0 {
            InvoiceStatus::Paid
        } else if amount_due_minor_units >= total_minor_units {
            InvoiceStatus::Open
        } else {
            InvoiceStatus::PartiallyPaid
        }
    }
}

/// Invoice owned by the invoicing service; this engine only moves `amount_due`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub invoice_number: String,
    pub total_minor_units: i64,
    pub amount_due_minor_units: i64,
    pub contact_name: String,
    pub status: InvoiceStatus,
    pub issue_date: NaiveDate,
}

impl Invoice {
    /// Open = something left to pay and not voided.
    pub fn is_open(&self) -> bool {
        self.amount_due_minor_units > 0 && self.status != InvoiceStatus::Void
    }

    /// Reject ledger rows that would break the allocation arithmetic.
    pub fn check_consistency(&self) -> Result<(), AllocationError> {
        if self.total_minor_units < 0 {
            return Err(AllocationError::ValidationError(format!(
                "invoice {} has a negative total ({})",
                self.id, self.total_minor_units
            )));
        }
        if self.amount_due_minor_units < 0 || self.amount_due_minor_units > self.total_minor_units
        {
            return Err(AllocationError::ValidationError(format!(
                "invoice {} amount due {} is outside [0, {}]",
                self.id, self.amount_due_minor_units, self.total_minor_units
            )));
        }
        Ok(())
    }

    /// Apply a signed change to the amount due, keeping it inside `[0, total]`.
    pub fn apply_amount_due_delta(&mut self, delta: i64) -> Result<(), AllocationError> {
        let new_due = self.amount_due_minor_units + delta;
        if new_due < 0 || new_due > self.total_minor_units {
            return Err(AllocationError::ContractViolation(format!(
                "invoice {}: amount due {} {:+} would leave [0, {}]",
                self.id, self.amount_due_minor_units, delta, self.total_minor_units
            )));
        }
        self.amount_due_minor_units = new_due;
        self.status = self.status.recompute(self.total_minor_units, new_due);
        Ok(())
    }

    /// Sort key defining "invoice order": oldest first, then by number.
    pub fn order_key(&self) -> (NaiveDate, &str, &str) {
        (self.issue_date, self.invoice_number.as_str(), self.id.as_str())
    }
}
