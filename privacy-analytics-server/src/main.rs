use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use privacy_analytics::{
    load_config, AggregationEngine, AnalyticsConfig, AuditSink, CompositeAuditSink, ConfigFormat,
    InMemoryRecordSource, MemoryAuditSink, NoiseMechanism, PrivacyLedger, TracingAuditSink,
};
use privacy_analytics_server::{
    persistence::LedgerStore, router, undersized_mean_groups, AppState,
};

#[derive(Debug, Parser)]
#[command(
    name = "privacy-analytics-server",
    version,
    about = "Serves differentially private customer analytics over HTTP"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML). Built-in defaults when omitted.
    #[arg(long, env = "ANALYTICS_CONFIG")]
    config: Option<PathBuf>,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    #[arg(long, env = "ANALYTICS_LISTEN", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,
    /// JSON array of depersonalized customer records (see data/customers.json).
    /// The five sample customers are served when omitted.
    #[arg(long, env = "ANALYTICS_RECORDS")]
    records: Option<PathBuf>,
    /// Ledger state file: loaded on start, rewritten after every release.
    #[arg(long, env = "ANALYTICS_LEDGER_STATE")]
    ledger_state: Option<PathBuf>,
    /// Audit events kept in memory for the audit endpoint.
    #[arg(long, default_value_t = 1_024)]
    audit_capacity: usize,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => load_config(path, cli.config_format)?,
        None => AnalyticsConfig::sample(),
    };

    let records = match &cli.records {
        Some(path) => InMemoryRecordSource::from_json_file(path)
            .with_context(|| format!("loading records from {}", path.display()))?,
        None => InMemoryRecordSource::sample(),
    };
    let undersized = undersized_mean_groups(&records, &config);
    if !undersized.is_empty() {
        tracing::warn!(
            min_group_size = config.sensitivity.min_group_size,
            groups = ?undersized,
            "record set cannot satisfy the minimum group size; affected requests will be withheld"
        );
    }

    let memory_audit = Arc::new(MemoryAuditSink::new(cli.audit_capacity));
    let audit: Arc<dyn AuditSink> = Arc::new(CompositeAuditSink::new(vec![
        memory_audit.clone(),
        Arc::new(TracingAuditSink),
    ]));

    let budget_defaults = config.budget.clone();
    let mut engine = AggregationEngine::new(
        config,
        Arc::new(records),
        NoiseMechanism::secure()?,
        audit,
    )?;
    let store = cli.ledger_state.as_ref().map(|path| Arc::new(LedgerStore::new(path)));
    if let Some(store) = &store {
        if let Some(state) = store.load().await? {
            tracing::info!(principals = state.principals.len(), path = %store.path().display(), "restored ledger state");
            engine = engine.with_ledger(PrivacyLedger::restore(budget_defaults, state)?);
        }
    }
    let engine = Arc::new(engine);

    let mut state = AppState::new(engine.clone(), memory_audit);
    if let Some(store) = &store {
        state = state.with_ledger_store(store.clone());
    }
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    tracing::info!(listen = %cli.listen, "privacy analytics server starting");
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Saved on every exit path, including a failed serve.
    if let Some(store) = &store {
        store.save(engine.ledger()).await?;
        tracing::info!(path = %store.path().display(), "saved ledger state");
    }
    let snapshot = engine.telemetry().flush();
    tracing::info!(counters = ?snapshot.counters, epsilon = ?snapshot.epsilon, "final telemetry");
    served.context("http server failed")
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}
