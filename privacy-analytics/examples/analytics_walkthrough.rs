use std::sync::Arc;

use privacy_analytics::{
    AggregationEngine, AnalyticsConfig, InMemoryRecordSource, MemoryAuditSink, NoiseMechanism,
    Principal, QueryFacade, QuerySpec,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cfg = AnalyticsConfig::sample();
    // The five seeded customers are too few for per-category means at the default floor.
    cfg.sensitivity.min_group_size = 1;

    let audit = Arc::new(MemoryAuditSink::new(32));
    let engine = Arc::new(AggregationEngine::new(
        cfg,
        Arc::new(InMemoryRecordSource::sample()),
        NoiseMechanism::secure()?,
        audit.clone(),
    )?);
    let facade = QueryFacade::new(engine.clone());
    let analyst = Principal::new("walkthrough");

    let summary = facade.customer_summary(&analyst).await?;
    println!(
        "[summary] customers={} avg_income={} used={:.2}",
        summary.total_customers, summary.average_income, summary.privacy_budget_used
    );

    let trend = facade.trend(&analyst).await?;
    println!(
        "[trend] top={:?} used={:.2}",
        trend.trend_insights.top_category, trend.privacy_budget_used
    );

    match engine.answer(&analyst, &QuerySpec::count(0.5)).await {
        Ok(stat) => println!("[count] unexpected release {:?}", stat.value),
        Err(err) => println!(
            "[count] rejected reason={} retryable={}",
            err.reason().as_str(),
            err.reason().is_retryable()
        ),
    }

    let snapshot = engine.telemetry().flush();
    println!(
        "[telemetry] counters={:?} audit_events={}",
        snapshot.counters,
        audit.len()
    );
    Ok(())
}
