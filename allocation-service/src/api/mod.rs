//! JSON API for allocation-service.

pub mod handlers;

use crate::services::record_http_request;
use crate::startup::AppState;
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};

pub use handlers::{TenantId, TENANT_HEADER};

/// Versioned API routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments", post(handlers::process_payments))
        .route(
            "/v1/payments/:payment_id/manual",
            post(handlers::apply_manual_decision),
        )
        .route(
            "/v1/allocations/:allocation_id/reverse",
            post(handlers::reverse_allocation),
        )
        .route(
            "/v1/contacts/:contact_id/apply-credit",
            post(handlers::apply_credit),
        )
        .route(
            "/v1/contacts/:contact_id/credit",
            get(handlers::get_credit_balance),
        )
        .route("/v1/escalations", get(handlers::list_escalations))
}

/// Count requests per matched route and status code.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;
    record_http_request(&route, response.status().as_str());
    response
}
