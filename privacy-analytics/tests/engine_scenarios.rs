use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use privacy_analytics::{
    AggregationEngine, AnalyticsConfig, AnalyticsError, AuditEvent, ConstantNoise, CustomerRecord,
    GroupBy, GroupField, InMemoryRecordSource, MemoryAuditSink, NoiseMechanism, NumericField,
    NoiseError, NoiseSource, Predicate, Principal, PrivacyCost, QueryFacade, QuerySpec,
    RecordSource, RecordSourceError, RejectionReason, SeededNoise,
};

const CATEGORIES: [&str; 5] = ["Electronics", "Clothing", "Home & Garden", "Books", "Sports"];
const REGIONS: [&str; 4] = ["North", "South", "East", "West"];

/// Six customers per category spread over the four regions.
fn population() -> Vec<CustomerRecord> {
    let mut records = Vec::new();
    for (c, category) in CATEGORIES.iter().enumerate() {
        for i in 0..6u32 {
            records.push(CustomerRecord {
                age: 22 + 7 * i,
                income: 40_000.0 + 5_000.0 * f64::from(i),
                purchase_frequency: 4 + i + c as u32,
                avg_order_value: 60.0 + 20.0 * c as f64,
                region: REGIONS[(i as usize + c) % REGIONS.len()].into(),
                product_category: (*category).into(),
            });
        }
    }
    records
}

fn engine(
    config: AnalyticsConfig,
    source: Arc<dyn RecordSource>,
    noise: NoiseMechanism,
    audit: Arc<MemoryAuditSink>,
) -> Arc<AggregationEngine> {
    Arc::new(AggregationEngine::new(config, source, noise, audit).unwrap())
}

fn seeded() -> NoiseMechanism {
    NoiseMechanism::new(Arc::new(SeededNoise::new(2024)))
}

fn constant(offset: f64) -> NoiseMechanism {
    NoiseMechanism::new(Arc::new(ConstantNoise(offset)))
}

struct CountingSource {
    inner: InMemoryRecordSource,
    calls: AtomicUsize,
}

#[async_trait]
impl RecordSource for CountingSource {
    async fn fetch(&self, predicate: &Predicate) -> Result<Vec<CustomerRecord>, RecordSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(predicate).await
    }
}

struct SlowSource;

#[async_trait]
impl RecordSource for SlowSource {
    async fn fetch(&self, _predicate: &Predicate) -> Result<Vec<CustomerRecord>, RecordSourceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

struct FailingSource;

#[async_trait]
impl RecordSource for FailingSource {
    async fn fetch(&self, _predicate: &Predicate) -> Result<Vec<CustomerRecord>, RecordSourceError> {
        Err(RecordSourceError::Unavailable("replica offline".into()))
    }
}

/// Entropy source that is always down.
struct FailingNoise;

impl NoiseSource for FailingNoise {
    fn laplace(&self, _scale: f64) -> Result<f64, NoiseError> {
        Err(NoiseError::Entropy("getrandom: device not ready".into()))
    }

    fn gaussian(&self, _sigma: f64) -> Result<f64, NoiseError> {
        Err(NoiseError::Entropy("getrandom: device not ready".into()))
    }
}

#[tokio::test]
async fn summary_then_trend_then_budget_exhaustion() {
    let audit = Arc::new(MemoryAuditSink::new(64));
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(InMemoryRecordSource::new(population())),
        seeded(),
        audit.clone(),
    );
    let facade = QueryFacade::new(engine.clone());
    let analyst = Principal::new("analyst-1");

    let summary = facade.customer_summary(&analyst).await.unwrap();
    assert!((summary.privacy_budget_used - 0.3).abs() < 1e-9);
    assert!((summary.epsilon_spent - 0.3).abs() < 1e-9);
    assert_eq!(
        summary.regional_breakdown.keys().collect::<Vec<_>>(),
        vec!["East", "North", "South", "West"]
    );

    let trend = facade.trend(&analyst).await.unwrap();
    assert!((trend.privacy_budget_used - 0.7).abs() < 1e-9);
    assert_eq!(trend.category_performance.len(), CATEGORIES.len());
    assert!(trend
        .category_performance
        .values()
        .all(|sales| (0.0..=25.0).contains(sales)));
    assert!(trend.trend_insights.top_category.is_some());
    assert!(trend.age_distribution.is_none());

    let err = engine
        .answer(&analyst, &QuerySpec::count(0.5))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalyticsError::BudgetExceeded { .. }));
    assert_eq!(err.reason(), RejectionReason::BudgetExceeded);
    assert!(!err.reason().is_retryable());
    assert_eq!(
        engine.ledger().spent(&analyst),
        PrivacyCost::new(0.7, 0.0).unwrap()
    );
    assert_eq!(engine.telemetry().counter("queries.answered"), 5);
    assert_eq!(engine.telemetry().counter("queries.rejected.budget_exceeded"), 1);
    assert!(matches!(
        audit.events_for(&analyst).last(),
        Some(AuditEvent::Rejection { .. })
    ));
}

#[tokio::test]
async fn small_group_mean_is_withheld_and_spends_nothing() {
    let mut records = population();
    records.retain(|record| record.region != "West");
    for _ in 0..2 {
        records.push(CustomerRecord {
            region: "West".into(),
            ..records[0].clone()
        });
    }
    let audit = Arc::new(MemoryAuditSink::new(16));
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(InMemoryRecordSource::new(records)),
        seeded(),
        audit.clone(),
    );
    let analyst = Principal::new("analyst-2");
    let spec = QuerySpec::grouped_mean(
        NumericField::Income,
        GroupBy::new(GroupField::Region, ["North", "West"]),
        0.2,
    );

    let err = engine.answer(&analyst, &spec).await.unwrap_err();
    match &err {
        AnalyticsError::InsufficientGroupSize {
            group,
            min_group_size,
        } => {
            assert_eq!(group, "West");
            assert_eq!(*min_group_size, 5);
        }
        other => panic!("expected InsufficientGroupSize, got {other:?}"),
    }
    assert_eq!(engine.ledger().spent(&analyst), PrivacyCost::ZERO);
    assert_eq!(engine.ledger().remaining(&analyst), (1.0, 0.0));
    assert_eq!(engine.telemetry().counter("ledger.rollbacks"), 1);
    let events = audit.events_for(&analyst);
    assert!(matches!(events[0], AuditEvent::Rollback { .. }));
}

#[tokio::test]
async fn grouped_query_charges_the_sum_of_its_groups() {
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(InMemoryRecordSource::new(population())),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let analyst = Principal::new("analyst-3");
    let spec = QuerySpec::grouped_count(GroupBy::new(GroupField::Region, REGIONS), 0.1);

    let released = engine.answer(&analyst, &spec).await.unwrap();
    assert_eq!(released.value.as_grouped().unwrap().len(), 4);
    assert!((released.epsilon_spent - 0.1).abs() < 1e-12);
    // Neither the per-group 0.025 nor 4 x 0.1.
    assert_eq!(
        engine.ledger().spent(&analyst),
        PrivacyCost::new(0.1, 0.0).unwrap()
    );
}

#[tokio::test]
async fn clamping_a_noisy_count_costs_nothing_extra() {
    let analyst = Principal::new("analyst-4");
    let mut spent = Vec::new();
    for offset in [0.0, -1_000.0] {
        let engine = engine(
            AnalyticsConfig::sample(),
            Arc::new(InMemoryRecordSource::new(population())),
            constant(offset),
            Arc::new(MemoryAuditSink::new(8)),
        );
        let released = engine.answer(&analyst, &QuerySpec::count(0.1)).await.unwrap();
        if offset < 0.0 {
            assert_eq!(released.value.as_scalar(), Some(0.0));
        } else {
            assert_eq!(released.value.as_scalar(), Some(30.0));
        }
        spent.push(engine.ledger().spent(&analyst));
    }
    assert_eq!(spent[0], spent[1]);
}

#[tokio::test]
async fn record_source_timeout_rolls_back() {
    let mut config = AnalyticsConfig::sample();
    config.engine.record_source_timeout_ms = 25;
    let engine = engine(
        config,
        Arc::new(SlowSource),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let analyst = Principal::new("analyst-5");

    let err = engine
        .answer(&analyst, &QuerySpec::count(0.4))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), RejectionReason::RecordSourceUnavailable);
    assert!(err.reason().is_retryable());
    assert_eq!(engine.ledger().spent(&analyst), PrivacyCost::ZERO);
    assert_eq!(engine.budget(&analyst).reserved_epsilon, 0.0);
}

#[tokio::test]
async fn record_source_failure_rolls_back_the_whole_batch() {
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(FailingSource),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let analyst = Principal::new("analyst-6");
    let facade = QueryFacade::new(engine.clone());

    let err = facade.customer_summary(&analyst).await.unwrap_err();
    assert!(matches!(err, AnalyticsError::RecordSourceUnavailable(_)));
    assert_eq!(engine.ledger().remaining(&analyst), (1.0, 0.0));
}

#[tokio::test]
async fn cancelled_request_releases_its_reservation() {
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(SlowSource),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let analyst = Principal::new("analyst-7");
    let spec = QuerySpec::count(0.6);

    let pending = tokio::time::timeout(Duration::from_millis(20), engine.answer(&analyst, &spec));
    assert!(pending.await.is_err());
    assert_eq!(engine.ledger().remaining(&analyst), (1.0, 0.0));
}

#[tokio::test]
async fn rejected_queries_never_touch_the_record_source() {
    let source = Arc::new(CountingSource {
        inner: InMemoryRecordSource::new(population()),
        calls: AtomicUsize::new(0),
    });
    let engine = engine(
        AnalyticsConfig::sample(),
        source.clone(),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let analyst = Principal::new("analyst-8");

    engine.answer(&analyst, &QuerySpec::count(1.0)).await.unwrap();
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    for spec in [
        QuerySpec::count(0.1),
        QuerySpec::mean(NumericField::Income, -0.1),
    ] {
        assert!(engine.answer(&analyst, &spec).await.is_err());
    }
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_queries_spend_again_and_say_so() {
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(InMemoryRecordSource::new(population())),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let analyst = Principal::new("analyst-9");
    let spec = QuerySpec::mean(NumericField::PurchaseFrequency, 0.2);

    let first = engine.answer(&analyst, &spec).await.unwrap();
    let second = engine.answer(&analyst, &spec).await.unwrap();
    assert_eq!(first.query_id, second.query_id);
    assert_eq!(first.prior_releases, 0);
    assert_eq!(second.prior_releases, 1);
    assert!((second.privacy_budget_used - 0.4).abs() < 1e-12);
    assert_eq!(
        engine.ledger().spent(&analyst),
        PrivacyCost::new(0.4, 0.0).unwrap()
    );

    // Another principal asking the same question starts its own history.
    let other = engine
        .answer(&Principal::new("analyst-10"), &spec)
        .await
        .unwrap();
    assert_eq!(other.prior_releases, 0);
}

#[tokio::test]
async fn gaussian_releases_charge_delta() {
    let mut config = AnalyticsConfig::sample();
    config.budget.total_delta = 1e-5;
    let engine = engine(
        config,
        Arc::new(InMemoryRecordSource::new(population())),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let analyst = Principal::new("analyst-11");

    let released = engine
        .answer(&analyst, &QuerySpec::count(0.5).with_delta(4e-6))
        .await
        .unwrap();
    assert!((released.delta_spent - 4e-6).abs() < 1e-15);
    let (_, delta_left) = engine.ledger().remaining(&analyst);
    assert!((delta_left - 6e-6).abs() < 1e-15);

    let err = engine
        .answer(&analyst, &QuerySpec::count(0.1).with_delta(7e-6))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), RejectionReason::BudgetExceeded);
}

#[tokio::test]
async fn trend_reports_age_distribution_when_configured() {
    let mut config = AnalyticsConfig::sample();
    config.facade.trend_category_epsilon = 0.3;
    config.facade.trend_age_epsilon = Some(0.2);
    let engine = engine(
        config,
        Arc::new(InMemoryRecordSource::new(population())),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let facade = QueryFacade::new(engine);

    let trend = facade.trend(&Principal::new("analyst-12")).await.unwrap();
    let ages = trend.age_distribution.unwrap();
    assert_eq!(
        ages.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["18-30", "31-40", "41-50", "50+"]
    );
    assert!(trend.trend_insights.dominant_age_group.is_some());
    assert!((trend.epsilon_spent - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn noise_failure_rolls_back_a_single_query() {
    let audit = Arc::new(MemoryAuditSink::new(16));
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(InMemoryRecordSource::new(population())),
        NoiseMechanism::new(Arc::new(FailingNoise)),
        audit.clone(),
    );
    let analyst = Principal::new("analyst-12");

    let err = engine
        .answer(&analyst, &QuerySpec::count(0.2))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalyticsError::NoiseUnavailable(_)));
    assert_eq!(err.reason(), RejectionReason::NoiseUnavailable);
    assert!(err.reason().is_retryable());

    let budget = engine.budget(&analyst);
    assert_eq!(engine.ledger().spent(&analyst), PrivacyCost::ZERO);
    assert_eq!(budget.reserved_epsilon, 0.0);
    assert_eq!(budget.remaining_epsilon, 1.0);
    assert_eq!(engine.telemetry().counter("ledger.rollbacks"), 1);
    assert_eq!(engine.telemetry().counter("queries.rejected.noise_unavailable"), 1);
    assert!(audit
        .events_for(&analyst)
        .iter()
        .any(|event| matches!(event, AuditEvent::Rollback { .. })));
}

#[tokio::test]
async fn noise_failure_rolls_back_a_whole_summary() {
    let engine = engine(
        AnalyticsConfig::sample(),
        Arc::new(InMemoryRecordSource::new(population())),
        NoiseMechanism::new(Arc::new(FailingNoise)),
        Arc::new(MemoryAuditSink::new(16)),
    );
    let facade = QueryFacade::new(engine.clone());
    let analyst = Principal::new("analyst-13");

    let err = facade.customer_summary(&analyst).await.unwrap_err();
    assert!(matches!(err, AnalyticsError::NoiseUnavailable(_)));
    assert!(err.reason().is_retryable());
    assert_eq!(engine.ledger().spent(&analyst), PrivacyCost::ZERO);
    assert_eq!(engine.budget(&analyst).reserved_epsilon, 0.0);
    assert_eq!(engine.telemetry().counter("ledger.rollbacks"), 1);
    assert_eq!(engine.telemetry().counter("queries.answered"), 0);
}

#[tokio::test]
async fn batch_fetches_each_distinct_predicate_once() {
    let source = Arc::new(CountingSource {
        inner: InMemoryRecordSource::new(population()),
        calls: AtomicUsize::new(0),
    });
    let engine = engine(
        AnalyticsConfig::sample(),
        source.clone(),
        seeded(),
        Arc::new(MemoryAuditSink::new(8)),
    );
    let facade = QueryFacade::new(engine.clone());
    let analyst = Principal::new("analyst-14");

    facade.customer_summary(&analyst).await.unwrap();
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    let north = Predicate::all().with(GroupField::Region, "North");
    let specs = [
        QuerySpec::count(0.05),
        QuerySpec::count(0.05).with_predicate(north.clone()),
        QuerySpec::mean(NumericField::Income, 0.05).with_predicate(north),
    ];
    let released = engine.answer_batch(&analyst, &specs).await.unwrap();
    assert_eq!(released.len(), 3);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
}
