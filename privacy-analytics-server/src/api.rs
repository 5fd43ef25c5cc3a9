use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use privacy_analytics::{
    AnalyticsError, AuditEvent, BudgetSnapshot, CustomerSummary, Principal, RejectionReason,
    TrendReport,
};
use serde::{Deserialize, Serialize};

use crate::AppState;

pub const PRINCIPAL_HEADER: &str = "x-analytics-principal";
pub const ROLE_HEADER: &str = "x-analytics-role";

/// Most recent audit entries returned per request.
const AUDIT_PAGE: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub enum ApiError {
    MissingPrincipal,
    AdminRequired,
    Rejected(AnalyticsError),
    /// Spend was committed but could not be made durable; nothing is released.
    LedgerUnavailable(String),
}

impl From<AnalyticsError> for ApiError {
    fn from(err: AnalyticsError) -> Self {
        ApiError::Rejected(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingPrincipal => StatusCode::UNAUTHORIZED,
            ApiError::AdminRequired => StatusCode::FORBIDDEN,
            ApiError::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Rejected(err) => match err.reason() {
                RejectionReason::BudgetExceeded => StatusCode::FORBIDDEN,
                RejectionReason::InsufficientGroupSize => StatusCode::UNPROCESSABLE_ENTITY,
                RejectionReason::InvalidQuerySpec => StatusCode::BAD_REQUEST,
                RejectionReason::RecordSourceUnavailable | RejectionReason::NoiseUnavailable => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RejectionReason::InvalidConfiguration => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            ApiError::MissingPrincipal => ErrorBody {
                error: "unauthenticated".into(),
                message: format!("missing {PRINCIPAL_HEADER} header"),
                retryable: false,
            },
            ApiError::AdminRequired => ErrorBody {
                error: "forbidden".into(),
                message: "admin access required".into(),
                retryable: false,
            },
            ApiError::LedgerUnavailable(details) => ErrorBody {
                error: "ledger_unavailable".into(),
                message: format!("privacy ledger could not be saved: {details}"),
                retryable: true,
            },
            ApiError::Rejected(err) => ErrorBody {
                error: err.reason().as_str().into(),
                message: err.to_string(),
                retryable: err.reason().is_retryable(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

fn principal(headers: &HeaderMap) -> Result<Principal, ApiError> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(Principal::new)
        .ok_or(ApiError::MissingPrincipal)
}

async fn persist(state: &AppState) -> Result<(), ApiError> {
    let Some(store) = &state.ledger_store else {
        return Ok(());
    };
    store.save(state.engine().ledger()).await.map_err(|err| {
        tracing::error!(path = %store.path().display(), error = %err, "failed to save ledger state");
        ApiError::LedgerUnavailable(err.to_string())
    })
}

fn require_admin(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let caller = principal(headers)?;
    let is_admin = headers
        .get(ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|role| role.trim().eq_ignore_ascii_case("admin"));
    if is_admin {
        Ok(caller)
    } else {
        Err(ApiError::AdminRequired)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub default_total_epsilon: f64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        timestamp: Utc::now(),
        default_total_epsilon: state.engine().config().budget.total_epsilon,
    })
}

pub async fn customers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CustomerSummary>, ApiError> {
    let caller = principal(&headers)?;
    let summary = state.facade.customer_summary(&caller).await?;
    persist(&state).await?;
    Ok(Json(summary))
}

pub async fn trends(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TrendReport>, ApiError> {
    let caller = principal(&headers)?;
    let report = state.facade.trend(&caller).await?;
    persist(&state).await?;
    Ok(Json(report))
}

pub async fn budget(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BudgetSnapshot>, ApiError> {
    let caller = principal(&headers)?;
    Ok(Json(state.engine().budget(&caller)))
}

pub async fn reset_budget(
    State(state): State<AppState>,
    Path(target): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BudgetSnapshot>, ApiError> {
    let admin = require_admin(&headers)?;
    let target = Principal::new(target);
    tracing::info!(%admin, %target, "administrative budget reset");
    let snapshot = state.engine().reset_budget(&target);
    persist(&state).await?;
    Ok(Json(snapshot))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    pub audit_entries: Vec<AuditEvent>,
    pub total_entries: usize,
}

pub async fn audit(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuditPage>, ApiError> {
    require_admin(&headers)?;
    let events = state.audit.events();
    let total_entries = events.len();
    let audit_entries = events
        .into_iter()
        .skip(total_entries.saturating_sub(AUDIT_PAGE))
        .collect();
    Ok(Json(AuditPage {
        audit_entries,
        total_entries,
    }))
}
