use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::commission::{DistributionError, DistributionOrchestrator, DistributionSummary};
use crate::models::{Account, PayoutRecord};
use crate::money::{parse_amount, serde_decimal, Amount};
use crate::store::CommissionDb;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<CommissionDb>,
    pub orchestrator: Arc<DistributionOrchestrator>,
}

impl AppState {
    pub fn from_db(db: Arc<CommissionDb>) -> Self {
        let orchestrator = Arc::new(DistributionOrchestrator::from_db(db.clone()));
        Self { db, orchestrator }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/distributions/purchase", post(distribute_purchase))
        .route("/api/distributions/return", post(distribute_return))
        .route("/api/accounts/:id", get(get_account))
        .route("/api/accounts/:id/payouts", get(get_account_payouts))
        .route("/api/events/:event_ref/payouts", get(get_event_payouts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Level income for a package purchase
async fn distribute_purchase(
    State(state): State<AppState>,
    Json(req): Json<PurchaseRequest>,
) -> Result<Json<DistributionSummary>, ApiError> {
    let amount = parse_request_amount(&req.amount)?;
    let event_ref = require_field("event_ref", &req.event_ref)?;
    let buyer_id = require_field("buyer_id", &req.buyer_id)?;
    let package_ref = require_field("package_ref", &req.package_ref)?;

    let summary = state
        .orchestrator
        .distribute_on_purchase(buyer_id, amount, package_ref, event_ref)
        .await?;
    Ok(Json(summary))
}

/// ROI-on-ROI for a return credit
async fn distribute_return(
    State(state): State<AppState>,
    Json(req): Json<ReturnRequest>,
) -> Result<Json<DistributionSummary>, ApiError> {
    let amount = parse_request_amount(&req.amount)?;
    let event_ref = require_field("event_ref", &req.event_ref)?;
    let recipient_id = require_field("recipient_id", &req.recipient_id)?;

    let summary = state
        .orchestrator
        .distribute_on_return(recipient_id, amount, event_ref)
        .await?;
    Ok(Json(summary))
}

async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    state
        .db
        .get_account(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(format!("Account {} not found", id)))
}

async fn get_account_payouts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PayoutQuery>,
) -> Result<Json<PayoutsResponse>, ApiError> {
    if state.db.get_account(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Account {} not found", id)));
    }
    let limit = params.limit.unwrap_or(50).min(500);
    let payouts = state.db.payouts_for_recipient(&id, limit).await?;
    Ok(Json(PayoutsResponse::new(payouts)))
}

async fn get_event_payouts(
    State(state): State<AppState>,
    Path(event_ref): Path<String>,
) -> Result<Json<PayoutsResponse>, ApiError> {
    let payouts = state.db.payouts_for_event(&event_ref).await?;
    Ok(Json(PayoutsResponse::new(payouts)))
}

fn parse_request_amount(raw: &str) -> Result<Amount, ApiError> {
    parse_amount(raw).map_err(|e| ApiError::BadRequest(format!("invalid amount: {}", e)))
}

fn require_field<'a>(name: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("{} must not be empty", name)));
    }
    Ok(value)
}

// ===== Request/Response Types =====

/// Amounts travel as decimal strings ("1000", "12.5")
#[derive(Deserialize)]
struct PurchaseRequest {
    buyer_id: String,
    amount: String,
    package_ref: String,
    event_ref: String,
}

#[derive(Deserialize)]
struct ReturnRequest {
    recipient_id: String,
    amount: String,
    event_ref: String,
}

#[derive(Deserialize)]
struct PayoutQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct PayoutsResponse {
    count: usize,
    #[serde(with = "serde_decimal")]
    total_amount: Amount,
    payouts: Vec<PayoutRecord>,
}

impl PayoutsResponse {
    fn new(payouts: Vec<PayoutRecord>) -> Self {
        Self {
            count: payouts.len(),
            total_amount: payouts
                .iter()
                .fold(0, |acc: Amount, p| acc.saturating_add(p.amount)),
            payouts,
        }
    }
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Storage(anyhow::Error),
    NotFound(String),
    BadRequest(String),
    ConfigMissing(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Storage(err)
    }
}

impl From<DistributionError> for ApiError {
    fn from(err: DistributionError) -> Self {
        match err {
            DistributionError::ConfigMissing(reason) => ApiError::ConfigMissing(reason),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Storage(err) => {
                tracing::error!("Storage error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::ConfigMissing(reason) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("commission schedule unavailable: {}", reason),
            ),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
