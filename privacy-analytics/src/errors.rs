use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    budget::LedgerError, config::ConfigError, noise::NoiseError, records::RecordSourceError,
    sensitivity::SensitivityError, types::Principal,
};

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error(
        "privacy budget exhausted for {principal}: requested epsilon {requested_epsilon}, \
         {remaining_epsilon} remaining"
    )]
    BudgetExceeded {
        principal: Principal,
        requested_epsilon: f64,
        remaining_epsilon: f64,
    },
    /// The group's true size is deliberately not reported.
    #[error("group {group:?} is below the minimum group size of {min_group_size}")]
    InsufficientGroupSize { group: String, min_group_size: u32 },
    #[error("invalid query: {0}")]
    InvalidQuerySpec(String),
    #[error("record source unavailable: {0}")]
    RecordSourceUnavailable(String),
    #[error("noise source unavailable: {0}")]
    NoiseUnavailable(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AnalyticsError {
    pub fn reason(&self) -> RejectionReason {
        match self {
            AnalyticsError::BudgetExceeded { .. } => RejectionReason::BudgetExceeded,
            AnalyticsError::InsufficientGroupSize { .. } => RejectionReason::InsufficientGroupSize,
            AnalyticsError::InvalidQuerySpec(_) => RejectionReason::InvalidQuerySpec,
            AnalyticsError::RecordSourceUnavailable(_) => RejectionReason::RecordSourceUnavailable,
            AnalyticsError::NoiseUnavailable(_) => RejectionReason::NoiseUnavailable,
            AnalyticsError::Config(_) => RejectionReason::InvalidConfiguration,
        }
    }
}

impl From<LedgerError> for AnalyticsError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::BudgetExceeded {
                principal,
                requested_epsilon,
                remaining_epsilon,
                ..
            } => AnalyticsError::BudgetExceeded {
                principal,
                requested_epsilon,
                remaining_epsilon,
            },
            other => AnalyticsError::InvalidQuerySpec(other.to_string()),
        }
    }
}

impl From<SensitivityError> for AnalyticsError {
    fn from(err: SensitivityError) -> Self {
        AnalyticsError::InvalidQuerySpec(err.to_string())
    }
}

impl From<NoiseError> for AnalyticsError {
    fn from(err: NoiseError) -> Self {
        match err {
            NoiseError::Entropy(details) => AnalyticsError::NoiseUnavailable(details),
            other => AnalyticsError::InvalidQuerySpec(other.to_string()),
        }
    }
}

impl From<RecordSourceError> for AnalyticsError {
    fn from(err: RecordSourceError) -> Self {
        AnalyticsError::RecordSourceUnavailable(err.to_string())
    }
}

/// Enumerable rejection code handed to the presentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    BudgetExceeded,
    InsufficientGroupSize,
    InvalidQuerySpec,
    RecordSourceUnavailable,
    NoiseUnavailable,
    InvalidConfiguration,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::BudgetExceeded => "budget_exceeded",
            RejectionReason::InsufficientGroupSize => "insufficient_group_size",
            RejectionReason::InvalidQuerySpec => "invalid_query_spec",
            RejectionReason::RecordSourceUnavailable => "record_source_unavailable",
            RejectionReason::NoiseUnavailable => "noise_unavailable",
            RejectionReason::InvalidConfiguration => "invalid_configuration",
        }
    }

    /// Whether retrying can succeed without an administrative action. Budget
    /// exhaustion is terminal until the principal's budget is reset.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RejectionReason::RecordSourceUnavailable | RejectionReason::NoiseUnavailable
        )
    }
}
