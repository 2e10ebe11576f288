use service_core::error::AppError;
use service_core::retry::Retryable;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Payment {0} already processed")]
    AlreadyProcessed(String),

    #[error("Reversal conflict: {0}")]
    ReversalConflict(String),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),

    #[error("Escalation error: {0}")]
    EscalationError(String),
}

impl AllocationError {
    /// Short label used for the `errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            AllocationError::ValidationError(_) => "validation",
            AllocationError::NotFound(_) => "not_found",
            AllocationError::ConcurrencyConflict(_) => "concurrency_conflict",
            AllocationError::AlreadyProcessed(_) => "already_processed",
            AllocationError::ReversalConflict(_) => "reversal_conflict",
            AllocationError::ContractViolation(_) => "contract_violation",
            AllocationError::DatabaseError(_) => "database",
            AllocationError::EscalationError(_) => "escalation",
        }
    }
}

impl From<validator::ValidationErrors> for AllocationError {
    fn from(err: validator::ValidationErrors) -> Self {
        AllocationError::ValidationError(err.to_string())
    }
}

impl Retryable for AllocationError {
    fn is_retryable(&self) -> bool {
        matches!(self, AllocationError::ConcurrencyConflict(_))
    }
}

impl From<AllocationError> for AppError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::ValidationError(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            AllocationError::NotFound(e) => AppError::NotFound(anyhow::anyhow!(e)),
            AllocationError::ConcurrencyConflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            AllocationError::AlreadyProcessed(id) => {
                AppError::Conflict(anyhow::anyhow!("Payment {} already processed", id))
            }
            AllocationError::ReversalConflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            AllocationError::ContractViolation(e) => AppError::Unprocessable(anyhow::anyhow!(e)),
            AllocationError::DatabaseError(e) => AppError::DatabaseError(e),
            AllocationError::EscalationError(e) => AppError::InternalError(anyhow::anyhow!(e)),
        }
    }
}
