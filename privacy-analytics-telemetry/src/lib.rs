//! Telemetry facade for the privacy analytics engine. Counters, released
//! epsilon totals and latency histograms live in memory so operators (and
//! tests) can inspect instrumentation without an exporter.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Labels copied into every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Significant figures kept by latency histograms (1..=5).
    #[serde(default = "default_histogram_precision")]
    pub histogram_precision: u8,
    /// Largest latency a histogram accepts; longer samples are rejected.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
}

const fn default_histogram_precision() -> u8 {
    3
}

const fn default_max_latency_ms() -> u64 {
    3_600_000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::sample("analytics-engine")
    }
}

impl TelemetryConfig {
    pub fn sample(component: &str) -> Self {
        Self {
            labels: BTreeMap::from([("component".into(), component.to_owned())]),
            histogram_precision: default_histogram_precision(),
            max_latency_ms: default_max_latency_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
    #[error("epsilon gauge {metric} rejected non-finite or negative value {value}")]
    InvalidEpsilon { metric: String, value: f64 },
    #[error("latency histogram {metric} rejected sample {value}ms: {reason}")]
    LatencyRejected {
        metric: String,
        value: u64,
        reason: String,
    },
}

/// Percentile summary of one latency histogram.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    /// Cumulative epsilon attributed to each gauge name.
    pub epsilon: BTreeMap<String, f64>,
    pub latencies: BTreeMap<String, LatencySummary>,
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    epsilon: BTreeMap<String, f64>,
    latencies: BTreeMap<String, Histogram<u64>>,
}

#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::from_config(TelemetryConfig::default())
    }
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::default())),
        }
    }

    // A poisoned lock only means a panic happened mid-update of plain maps.
    fn state(&self) -> MutexGuard<'_, TelemetryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    pub fn record_epsilon(&self, name: &str, epsilon: f64) -> Result<(), TelemetryError> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(TelemetryError::InvalidEpsilon {
                metric: name.to_owned(),
                value: epsilon,
            });
        }
        *self.state().epsilon.entry(name.to_owned()).or_default() += epsilon;
        Ok(())
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) -> Result<(), TelemetryError> {
        let rejected = |reason: String| TelemetryError::LatencyRejected {
            metric: name.to_owned(),
            value,
            reason,
        };
        let precision = self.config.histogram_precision.clamp(1, 5);
        let high = self.config.max_latency_ms.max(2);
        let mut guard = self.state();
        let histogram = match guard.latencies.entry(name.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                Histogram::new_with_bounds(1, high, precision)
                    .map_err(|err| rejected(format!("{err:?}")))?,
            ),
        };
        histogram
            .record(value.max(1))
            .map_err(|err| rejected(format!("{err:?}")))
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.state().counters.get(name).copied().unwrap_or_default()
    }

    /// Reads the current state without clearing it.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let guard = self.state();
        self.build_snapshot(&guard)
    }

    /// Reads the current state and starts a fresh interval.
    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state();
        let snapshot = self.build_snapshot(&guard);
        *guard = TelemetryState::default();
        snapshot
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.labels
    }

    fn build_snapshot(&self, state: &TelemetryState) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels: self.config.labels.clone(),
            counters: state.counters.clone(),
            epsilon: state.epsilon.clone(),
            latencies: state
                .latencies
                .iter()
                .map(|(name, histogram)| (name.clone(), summarize(histogram)))
                .collect(),
        }
    }
}

fn summarize(histogram: &Histogram<u64>) -> LatencySummary {
    LatencySummary {
        count: histogram.len(),
        p50_ms: histogram.value_at_quantile(0.50),
        p95_ms: histogram.value_at_quantile(0.95),
        p99_ms: histogram.value_at_quantile(0.99),
        max_ms: histogram.max(),
    }
}
