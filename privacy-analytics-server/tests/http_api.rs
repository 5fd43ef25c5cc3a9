use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use pretty_assertions::assert_eq;
use privacy_analytics::{
    config::BudgetConfig, AggregationEngine, AnalyticsConfig, AnalyticsError, AuditEvent,
    ConstantNoise, CustomerRecord, InMemoryRecordSource, MemoryAuditSink, NoiseMechanism,
    Principal, PrivacyLedger,
};
use privacy_analytics_server::{
    api::{self, ApiError},
    persistence::LedgerStore,
    router, undersized_mean_groups, AppState, PRINCIPAL_HEADER, ROLE_HEADER,
};

fn records() -> Vec<CustomerRecord> {
    let regions = ["North", "South", "East", "West"];
    let categories = ["Electronics", "Clothing", "Home & Garden", "Books", "Sports"];
    (0..40u32)
        .map(|i| CustomerRecord {
            age: 20 + i,
            income: 30_000.0 + 1_000.0 * f64::from(i),
            purchase_frequency: 2 + i % 10,
            avg_order_value: 50.0 + f64::from(i),
            region: regions[i as usize % regions.len()].into(),
            product_category: categories[i as usize % categories.len()].into(),
        })
        .collect()
}

fn state() -> AppState {
    let audit = Arc::new(MemoryAuditSink::new(128));
    let engine = AggregationEngine::new(
        AnalyticsConfig::sample(),
        Arc::new(InMemoryRecordSource::new(records())),
        NoiseMechanism::new(Arc::new(ConstantNoise(0.0))),
        audit.clone(),
    )
    .unwrap();
    AppState::new(Arc::new(engine), audit)
}

fn headers(principal: &str, role: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(PRINCIPAL_HEADER, HeaderValue::from_str(principal).unwrap());
    if let Some(role) = role {
        headers.insert(ROLE_HEADER, HeaderValue::from_str(role).unwrap());
    }
    headers
}

#[tokio::test]
async fn summary_and_trend_share_one_budget() {
    let state = state();
    let caller = headers("analyst", None);

    let summary = api::customers(State(state.clone()), caller.clone())
        .await
        .unwrap()
        .0;
    assert_eq!(summary.total_customers, 40.0);
    assert_eq!(summary.regional_breakdown["North"].customer_count, 10.0);
    assert!((summary.privacy_budget_used - 0.3).abs() < 1e-9);

    let trend = api::trends(State(state.clone()), caller.clone())
        .await
        .unwrap()
        .0;
    assert_eq!(trend.category_performance.len(), 5);
    assert!((trend.privacy_budget_used - 0.7).abs() < 1e-9);

    let budget = api::budget(State(state.clone()), caller.clone())
        .await
        .unwrap()
        .0;
    assert!((budget.spent_epsilon - 0.7).abs() < 1e-9);
    assert!((budget.remaining_epsilon - 0.3).abs() < 1e-9);

    let err = api::trends(State(state.clone()), caller.clone())
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
    let body = err.body();
    assert_eq!(body.error, "budget_exceeded");
    assert!(!body.retryable);

    let budget = api::budget(State(state), caller).await.unwrap().0;
    assert!((budget.spent_epsilon - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn missing_principal_is_unauthorized() {
    let err = api::customers(State(state()), HeaderMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    let response = err.into_response();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn audit_and_reset_require_admin() {
    let state = state();
    api::customers(State(state.clone()), headers("analyst", None))
        .await
        .unwrap();

    let denied = api::audit(State(state.clone()), headers("analyst", None))
        .await
        .unwrap_err();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let page = api::audit(State(state.clone()), headers("ops", Some("admin")))
        .await
        .unwrap()
        .0;
    assert_eq!(page.total_entries, 4);
    assert!(page
        .audit_entries
        .iter()
        .all(|event| matches!(event, AuditEvent::Release { .. })));

    let denied = api::reset_budget(
        State(state.clone()),
        Path("analyst".to_string()),
        headers("analyst", Some("analyst")),
    )
    .await
    .unwrap_err();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let snapshot = api::reset_budget(
        State(state.clone()),
        Path("analyst".to_string()),
        headers("ops", Some("Admin")),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(snapshot.spent_epsilon, 0.0);
    assert_eq!(
        state.engine().budget(&Principal::new("analyst")).spent_epsilon,
        0.0
    );
}

#[test]
fn rejection_reasons_map_to_status_codes() {
    let cases = [
        (
            AnalyticsError::InsufficientGroupSize {
                group: "West".into(),
                min_group_size: 5,
            },
            StatusCode::UNPROCESSABLE_ENTITY,
            false,
        ),
        (
            AnalyticsError::InvalidQuerySpec("epsilon must be > 0".into()),
            StatusCode::BAD_REQUEST,
            false,
        ),
        (
            AnalyticsError::RecordSourceUnavailable("timeout".into()),
            StatusCode::SERVICE_UNAVAILABLE,
            true,
        ),
    ];
    for (err, status, retryable) in cases {
        let err = ApiError::from(err);
        assert_eq!(err.status(), status);
        assert_eq!(err.body().retryable, retryable);
    }
}

#[tokio::test]
async fn health_reports_default_budget() {
    let health = api::health(State(state())).await.0;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.default_total_epsilon, 1.0);
}

#[test]
fn router_builds_with_all_routes() {
    let _app = router(state());
}

#[tokio::test]
async fn every_release_is_saved_before_it_is_returned() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LedgerStore::new(dir.path().join("ledger.json")));
    let state = state().with_ledger_store(store.clone());
    let analyst = Principal::new("analyst");

    api::customers(State(state.clone()), headers("analyst", None))
        .await
        .unwrap();
    let saved = store.load().await.unwrap().unwrap();
    let restored = PrivacyLedger::restore(BudgetConfig::default(), saved).unwrap();
    assert!((restored.snapshot(&analyst).spent_epsilon - 0.3).abs() < 1e-9);

    api::trends(State(state.clone()), headers("analyst", None))
        .await
        .unwrap();
    let saved = store.load().await.unwrap().unwrap();
    let restored = PrivacyLedger::restore(BudgetConfig::default(), saved).unwrap();
    assert!((restored.snapshot(&analyst).spent_epsilon - 0.7).abs() < 1e-9);

    api::reset_budget(
        State(state),
        Path("analyst".to_string()),
        headers("ops", Some("admin")),
    )
    .await
    .unwrap();
    let saved = store.load().await.unwrap().unwrap();
    let restored = PrivacyLedger::restore(BudgetConfig::default(), saved).unwrap();
    assert_eq!(restored.snapshot(&analyst).spent_epsilon, 0.0);
}

#[tokio::test]
async fn unwritable_ledger_withholds_the_release() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LedgerStore::new(dir.path().join("missing").join("ledger.json")));
    let state = state().with_ledger_store(store);

    let err = api::customers(State(state.clone()), headers("analyst", None))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err.body().error, "ledger_unavailable");
    assert!(err.body().retryable);
    // The spend stays committed in memory.
    assert!(
        (state.engine().budget(&Principal::new("analyst")).spent_epsilon - 0.3).abs() < 1e-9
    );
}

#[test]
fn sample_customers_cannot_meet_the_default_group_size() {
    let config = AnalyticsConfig::sample();
    let undersized = undersized_mean_groups(&InMemoryRecordSource::sample(), &config);
    assert_eq!(undersized.len(), 5);
    assert!(undersized.contains(&"product_category=Books".to_owned()));

    let mut strict = AnalyticsConfig::sample();
    strict.sensitivity.min_group_size = 6;
    let undersized = undersized_mean_groups(&InMemoryRecordSource::sample(), &strict);
    assert_eq!(undersized[0], "all customers");

    assert!(undersized_mean_groups(&InMemoryRecordSource::new(records()), &config).is_empty());
}

#[test]
fn shipped_demo_data_meets_the_default_group_size() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("data/customers.json");
    let records = InMemoryRecordSource::from_json_file(&path).unwrap();
    assert!(undersized_mean_groups(&records, &AnalyticsConfig::sample()).is_empty());
}
