//! HTTP surface for the privacy analytics engine.
//!
//! Authentication happens upstream: the gateway forwards the caller's
//! principal in `x-analytics-principal` and role in `x-analytics-role`.

pub mod api;
pub mod persistence;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use privacy_analytics::{
    AggregationEngine, AnalyticsConfig, GroupField, InMemoryRecordSource, MemoryAuditSink,
    QueryFacade,
};

use crate::persistence::LedgerStore;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

pub use crate::api::{ApiError, ErrorBody, PRINCIPAL_HEADER, ROLE_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub facade: QueryFacade,
    pub audit: Arc<MemoryAuditSink>,
    /// When set, the ledger is saved after every change to committed spend.
    pub ledger_store: Option<Arc<LedgerStore>>,
}

impl AppState {
    pub fn new(engine: Arc<AggregationEngine>, audit: Arc<MemoryAuditSink>) -> Self {
        Self {
            facade: QueryFacade::new(engine),
            audit,
            ledger_store: None,
        }
    }

    pub fn with_ledger_store(mut self, store: Arc<LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        self.facade.engine()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/analytics/customers", get(api::customers))
        .route("/api/analytics/trends", get(api::trends))
        .route("/api/privacy/budget", get(api::budget))
        .route("/api/privacy/budget/:principal/reset", post(api::reset_budget))
        .route("/api/privacy/audit", get(api::audit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new().include_headers(false)),
        )
        .with_state(state)
}

/// Groups the facade means run over that hold fewer than `min-group-size`
/// records. Requests touching them are always withheld, so the server warns
/// at startup.
pub fn undersized_mean_groups(
    records: &InMemoryRecordSource,
    config: &AnalyticsConfig,
) -> Vec<String> {
    let min_group_size = config.sensitivity.min_group_size as usize;
    let mut undersized = Vec::new();
    if records.len() < min_group_size {
        undersized.push("all customers".to_owned());
    }
    undersized.extend(
        config
            .facade
            .categories
            .iter()
            .filter(|category| {
                records.group_size(GroupField::ProductCategory, category) < min_group_size
            })
            .map(|category| format!("{}={category}", GroupField::ProductCategory.as_str())),
    );
    undersized
}
