//! Differential-privacy accounting and noisy aggregation for customer analytics.
//!
//! Released statistics carry an (epsilon, delta) guarantee. The crate is built
//! from five pieces:
//!
//! - [`sensitivity`]: how far one record can move each query shape.
//! - [`noise`]: Laplace/Gaussian calibration behind an injectable
//!   [`NoiseSource`].
//! - [`budget`]: the per-principal [`PrivacyLedger`] with two-phase
//!   reserve/commit and exact rollback.
//! - [`engine`]: the [`AggregationEngine`], which authorizes, computes, noises
//!   and post-processes.
//! - [`facade`]: the customer-summary and trend request shapes.
//!
//! Budgets compose sequentially and grouped queries are charged the sum of
//! their per-group costs.

pub mod audit;
pub mod budget;
pub mod config;
pub mod engine;
pub mod errors;
pub mod facade;
pub mod noise;
pub mod records;
pub mod sensitivity;
pub mod types;

pub use crate::audit::{
    AuditEvent, AuditSink, CompositeAuditSink, MemoryAuditSink, NoopAuditSink, TracingAuditSink,
};
pub use crate::budget::{
    BudgetSnapshot, LedgerError, LedgerState, PrincipalLimits, PrivacyCost, PrivacyLedger,
    Reservation,
};
pub use crate::config::{load_config, AnalyticsConfig, ConfigError, ConfigFormat};
pub use crate::engine::{AggregationEngine, NoisyStatistic, StatisticValue};
pub use crate::errors::{AnalyticsError, AnalyticsResult, RejectionReason};
pub use crate::facade::{CustomerSummary, QueryFacade, RegionCount, TrendInsights, TrendReport};
pub use crate::noise::{
    ConstantNoise, NoiseError, NoiseMechanism, NoiseSource, SecureNoise, SeededNoise,
};
pub use crate::records::{CustomerRecord, InMemoryRecordSource, RecordSource, RecordSourceError};
pub use crate::sensitivity::{SensitivityProfile, ValueBounds};
pub use crate::types::{
    GroupBy, GroupField, NumericField, Predicate, Principal, QueryFingerprint, QueryShape,
    QuerySpec,
};
