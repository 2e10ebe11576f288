//! HTTP handlers for the allocation API.

use crate::models::{CreditBalance, EscalationTicket, IncomingPayment, ManualDecision};
use crate::services::{
    AllocationResult, BatchItem, CreditApplication, EscalationQueue, LedgerStore, ReversalResult,
};
use crate::startup::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant taken from the `x-tenant-id` header.
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| TenantId(s.to_string()))
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("{} header is required", TENANT_HEADER)))
    }
}

fn ensure_tenant(tenant: &TenantId, payment: &IncomingPayment) -> Result<(), AppError> {
    if payment.tenant_id != tenant.0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "payment {} belongs to tenant {}, not {}",
            payment.id,
            payment.tenant_id,
            tenant.0
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ProcessPaymentsRequest {
    pub payments: Vec<IncomingPayment>,
}

#[derive(Debug, Serialize)]
pub struct ProcessPaymentsResponse {
    pub results: Vec<BatchItem>,
}

/// POST /v1/payments
pub async fn process_payments(
    State(state): State<AppState>,
    tenant: TenantId,
    Json(req): Json<ProcessPaymentsRequest>,
) -> Result<Json<ProcessPaymentsResponse>, AppError> {
    if req.payments.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("payments must not be empty")));
    }
    for payment in &req.payments {
        ensure_tenant(&tenant, payment)?;
    }

    let results = state.engine.process_batch(req.payments).await;
    Ok(Json(ProcessPaymentsResponse { results }))
}

/// POST /v1/payments/:payment_id/manual
pub async fn apply_manual_decision(
    State(state): State<AppState>,
    tenant: TenantId,
    Path(payment_id): Path<String>,
    Json(decision): Json<ManualDecision>,
) -> Result<Json<AllocationResult>, AppError> {
    ensure_tenant(&tenant, &decision.payment)?;
    if decision.payment.id != payment_id {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "path payment {} does not match body payment {}",
            payment_id,
            decision.payment.id
        )));
    }

    let result = state.engine.apply_manual_decision(&decision).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ReverseRequest {
    pub reason: String,
}

/// POST /v1/allocations/:allocation_id/reverse
pub async fn reverse_allocation(
    State(state): State<AppState>,
    tenant: TenantId,
    Path(allocation_id): Path<Uuid>,
    Json(req): Json<ReverseRequest>,
) -> Result<Json<ReversalResult>, AppError> {
    let result = state
        .reversals
        .reverse(&tenant.0, allocation_id, &req.reason)
        .await?;
    Ok(Json(result))
}

/// POST /v1/contacts/:contact_id/apply-credit
pub async fn apply_credit(
    State(state): State<AppState>,
    tenant: TenantId,
    Path(contact_id): Path<String>,
) -> Result<Json<CreditApplication>, AppError> {
    let result = state
        .engine
        .apply_credit_balance(&tenant.0, &contact_id)
        .await?;
    Ok(Json(result))
}

/// GET /v1/contacts/:contact_id/credit
pub async fn get_credit_balance(
    State(state): State<AppState>,
    tenant: TenantId,
    Path(contact_id): Path<String>,
) -> Result<Json<CreditBalance>, AppError> {
    let balance = state.ledger.get_credit_balance(&tenant.0, &contact_id).await?;
    Ok(Json(CreditBalance {
        tenant_id: tenant.0,
        contact_id,
        balance_minor_units: balance,
    }))
}

#[derive(Debug, Serialize)]
pub struct EscalationsResponse {
    pub escalations: Vec<EscalationTicket>,
}

/// GET /v1/escalations
pub async fn list_escalations(
    State(state): State<AppState>,
    tenant: TenantId,
) -> Result<Json<EscalationsResponse>, AppError> {
    let escalations = state.escalations.pending(&tenant.0).await?;
    Ok(Json(EscalationsResponse { escalations }))
}
