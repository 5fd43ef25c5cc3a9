//! Aggregation engine: turns [`QuerySpec`]s into released [`NoisyStatistic`]s.
//!
//! Budget is reserved before the record source is touched, so a rejected
//! query reveals nothing about the data. Every exit after a successful
//! reservation either commits it (statistic released) or rolls it back
//! (nothing released); the [`Reservation`] guard covers early returns and
//! cancelled futures.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures_util::future::try_join_all;
use privacy_analytics_telemetry::{TelemetryHandle, TelemetrySnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    audit::{AuditEvent, AuditSink},
    budget::{BudgetSnapshot, PrivacyCost, PrivacyLedger, Reservation},
    config::{AnalyticsConfig, ConfigError},
    errors::{AnalyticsError, AnalyticsResult},
    noise::NoiseMechanism,
    records::{CustomerRecord, RecordSource, RecordSourceError},
    sensitivity::{sensitivity, SensitivityProfile, ValueBounds},
    types::{GroupBy, NumericField, Predicate, Principal, QueryFingerprint, QueryShape, QuerySpec},
};

/// Released value: a scalar or one value per declared group key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatisticValue {
    Scalar(f64),
    Grouped(BTreeMap<String, f64>),
}

impl StatisticValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            StatisticValue::Scalar(value) => Some(*value),
            StatisticValue::Grouped(_) => None,
        }
    }

    pub fn as_grouped(&self) -> Option<&BTreeMap<String, f64>> {
        match self {
            StatisticValue::Grouped(groups) => Some(groups),
            StatisticValue::Scalar(_) => None,
        }
    }
}

/// The only artifact that leaves the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoisyStatistic {
    pub query_id: String,
    pub shape: QueryShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measure: Option<NumericField>,
    pub value: StatisticValue,
    pub epsilon_spent: f64,
    pub delta_spent: f64,
    pub remaining_budget_fraction: f64,
    pub privacy_budget_used: f64,
    /// Earlier releases of the same question by this principal. Each one
    /// spent budget again and drew fresh noise.
    pub prior_releases: u32,
}

// Exact results never leave this module.
enum TrueStatistic {
    Scalar { value: f64 },
    Grouped { values: Vec<(String, f64)> },
}

struct QueryPlan<'a> {
    spec: &'a QuerySpec,
    fingerprint: QueryFingerprint,
    profile: SensitivityProfile,
    /// Cost of each independently noised part (one per group).
    per_part: PrivacyCost,
    parts: usize,
    charge: PrivacyCost,
}

pub struct AggregationEngine {
    config: AnalyticsConfig,
    ledger: PrivacyLedger,
    noise: NoiseMechanism,
    source: Arc<dyn RecordSource>,
    audit: Arc<dyn AuditSink>,
    telemetry: TelemetryHandle,
    releases: DashMap<(Principal, QueryFingerprint), u32>,
}

impl AggregationEngine {
    pub fn new(
        config: AnalyticsConfig,
        source: Arc<dyn RecordSource>,
        noise: NoiseMechanism,
        audit: Arc<dyn AuditSink>,
    ) -> AnalyticsResult<Self> {
        config.validate()?;
        let ledger = PrivacyLedger::new(config.budget.clone())
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
        Ok(Self {
            config,
            ledger,
            noise,
            source,
            audit,
            telemetry,
            releases: DashMap::new(),
        })
    }

    /// Replaces the ledger, e.g. with one restored from persisted state.
    pub fn with_ledger(mut self, ledger: PrivacyLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub fn ledger(&self) -> &PrivacyLedger {
        &self.ledger
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn budget(&self, principal: &Principal) -> BudgetSnapshot {
        self.ledger.snapshot(principal)
    }

    /// Administrative reset of a principal's spend.
    pub fn reset_budget(&self, principal: &Principal) -> BudgetSnapshot {
        let snapshot = self.ledger.reset(principal);
        self.emit(AuditEvent::budget_reset(principal));
        snapshot
    }

    pub async fn answer(
        &self,
        principal: &Principal,
        spec: &QuerySpec,
    ) -> AnalyticsResult<NoisyStatistic> {
        let mut released = self.answer_batch(principal, std::slice::from_ref(spec)).await?;
        released
            .pop()
            .ok_or_else(|| AnalyticsError::InvalidQuerySpec("empty release".into()))
    }

    /// Answers every spec under a single reservation: all are released or
    /// none are, and the ledger is charged the summed cost once.
    pub async fn answer_batch(
        &self,
        principal: &Principal,
        specs: &[QuerySpec],
    ) -> AnalyticsResult<Vec<NoisyStatistic>> {
        let result = self.run_batch(principal, specs).await;
        if let Err(err) = &result {
            let reason = err.reason();
            warn!(%principal, reason = reason.as_str(), error = %err, "query rejected");
            self.count(&format!("queries.rejected.{}", reason.as_str()), 1);
            self.emit(AuditEvent::rejection(principal, reason.as_str(), err.to_string()));
        }
        result
    }

    async fn run_batch(
        &self,
        principal: &Principal,
        specs: &[QuerySpec],
    ) -> AnalyticsResult<Vec<NoisyStatistic>> {
        if specs.is_empty() {
            return Err(AnalyticsError::InvalidQuerySpec(
                "at least one query is required".into(),
            ));
        }
        let plans = specs
            .iter()
            .map(|spec| self.plan(spec))
            .collect::<AnalyticsResult<Vec<_>>>()?;
        let total = plans
            .iter()
            .try_fold(PrivacyCost::ZERO, |acc, plan| acc.checked_add(plan.charge))
            .ok_or_else(|| AnalyticsError::InvalidQuerySpec("privacy cost overflow".into()))?;

        let reservation = self.ledger.authorize_cost(principal, total)?;

        let (record_sets, set_of_plan) = match self.fetch_all(&plans).await {
            Ok(fetched) => fetched,
            Err(err) => return Err(self.abort(reservation, err)),
        };

        let mut values = Vec::with_capacity(plans.len());
        for (plan, &set) in plans.iter().zip(&set_of_plan) {
            let records = record_sets[set].as_slice();
            let computed = self
                .true_statistic(plan, records)
                .and_then(|truth| self.release_value(plan, truth));
            match computed {
                Ok(value) => values.push(value),
                Err(err) => return Err(self.abort(reservation, err)),
            }
        }

        let snapshot = reservation.commit();
        self.count("queries.answered", plans.len() as u64);
        if let Err(err) = self.telemetry.record_epsilon("epsilon.released", total.epsilon()) {
            warn!(error = %err, "failed to record released epsilon");
        }

        let released = plans
            .iter()
            .zip(values)
            .map(|(plan, value)| {
                let prior_releases = self.note_release(principal, plan.fingerprint);
                let statistic = NoisyStatistic {
                    query_id: plan.fingerprint.to_hex(),
                    shape: plan.spec.shape,
                    measure: plan.spec.measure,
                    value,
                    epsilon_spent: plan.charge.epsilon(),
                    delta_spent: plan.charge.delta(),
                    remaining_budget_fraction: snapshot.remaining_fraction(),
                    privacy_budget_used: snapshot.used_fraction(),
                    prior_releases,
                };
                self.emit(AuditEvent::release(
                    principal,
                    statistic.query_id.clone(),
                    statistic.shape,
                    statistic.epsilon_spent,
                    statistic.delta_spent,
                    prior_releases,
                ));
                statistic
            })
            .collect();
        info!(
            %principal,
            queries = plans.len(),
            epsilon = total.epsilon(),
            used = snapshot.used_fraction(),
            "released noisy statistics"
        );
        Ok(released)
    }

    fn plan<'a>(&self, spec: &'a QuerySpec) -> AnalyticsResult<QueryPlan<'a>> {
        let invalid = |message: String| AnalyticsError::InvalidQuerySpec(message);
        if !spec.requested_epsilon.is_finite() || spec.requested_epsilon <= 0.0 {
            return Err(invalid(format!(
                "requested epsilon must be > 0 (got {})",
                spec.requested_epsilon
            )));
        }
        if !(0.0..1.0).contains(&spec.requested_delta) {
            return Err(invalid(format!(
                "requested delta must be within [0, 1) (got {})",
                spec.requested_delta
            )));
        }
        if spec.shape.is_mean() != spec.measure.is_some() {
            return Err(invalid(format!(
                "{} queries {} a measure",
                spec.shape.as_str(),
                if spec.shape.is_mean() { "require" } else { "do not take" }
            )));
        }
        if spec.shape.is_grouped() != spec.group_by.is_some() {
            return Err(invalid(format!(
                "{} queries {} a grouping",
                spec.shape.as_str(),
                if spec.shape.is_grouped() { "require" } else { "do not take" }
            )));
        }
        let parts = match &spec.group_by {
            Some(group_by) => check_group_domain(group_by)?,
            None => 1,
        };
        let bounds = spec
            .measure
            .map(|field| self.config.sensitivity.bounds.for_field(field));
        let profile = sensitivity(spec.shape, bounds, self.config.sensitivity.min_group_size)?;

        let requested = PrivacyCost::new(spec.requested_epsilon, spec.requested_delta)?;
        let per_part = requested.split(parts);
        if per_part.epsilon.is_zero() || (!requested.delta.is_zero() && per_part.delta.is_zero())
        {
            return Err(invalid(format!(
                "budget too small to split across {parts} groups"
            )));
        }
        let charge = per_part
            .checked_mul(parts)
            .ok_or_else(|| invalid("privacy cost overflow".into()))?;
        debug!(
            shape = spec.shape.as_str(),
            sensitivity = profile.sensitivity,
            parts,
            epsilon = charge.epsilon(),
            "planned query"
        );
        Ok(QueryPlan {
            spec,
            fingerprint: spec.fingerprint(),
            profile,
            per_part,
            parts,
            charge,
        })
    }

    /// Fetches each distinct predicate once. Returns the record sets and,
    /// for every plan, the index of the set it reads.
    async fn fetch_all(
        &self,
        plans: &[QueryPlan<'_>],
    ) -> AnalyticsResult<(Vec<Vec<CustomerRecord>>, Vec<usize>)> {
        let mut predicates: Vec<&Predicate> = Vec::new();
        let set_of_plan = plans
            .iter()
            .map(|plan| {
                let predicate = &plan.spec.predicate;
                match predicates.iter().position(|seen| *seen == predicate) {
                    Some(index) => index,
                    None => {
                        predicates.push(predicate);
                        predicates.len() - 1
                    }
                }
            })
            .collect();

        let timeout_ms = self.config.engine.record_source_timeout_ms;
        let started = Instant::now();
        let fetches = try_join_all(predicates.iter().map(|predicate| self.source.fetch(*predicate)));
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), fetches).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Err(err) = self
            .telemetry
            .record_latency_ms("latency.record_fetch_ms", elapsed_ms)
        {
            warn!(error = %err, "failed to record fetch latency");
        }
        match outcome {
            Ok(Ok(sets)) => Ok((sets, set_of_plan)),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(RecordSourceError::Timeout { timeout_ms }.into()),
        }
    }

    fn true_statistic(
        &self,
        plan: &QueryPlan<'_>,
        records: &[CustomerRecord],
    ) -> AnalyticsResult<TrueStatistic> {
        let spec = plan.spec;
        let min_group_size = self.config.sensitivity.min_group_size;
        let mean_of = |group: &str, members: &[&CustomerRecord]| -> AnalyticsResult<f64> {
            let (Some(field), Some(bounds)) = (spec.measure, plan.profile.bounds) else {
                return Err(AnalyticsError::InvalidQuerySpec("mean without bounds".into()));
            };
            if members.len() < min_group_size as usize {
                return Err(AnalyticsError::InsufficientGroupSize {
                    group: group.to_owned(),
                    min_group_size,
                });
            }
            Ok(clamped_mean(members, field, &bounds))
        };

        match (spec.shape, &spec.group_by) {
            (QueryShape::Count, None) => Ok(TrueStatistic::Scalar {
                value: records.len() as f64,
            }),
            (QueryShape::Mean, None) => {
                let members: Vec<&CustomerRecord> = records.iter().collect();
                Ok(TrueStatistic::Scalar {
                    value: mean_of("all", members.as_slice())?,
                })
            }
            (QueryShape::GroupedCount, Some(group_by)) => {
                let groups = partition(records, group_by);
                Ok(TrueStatistic::Grouped {
                    values: groups
                        .into_iter()
                        .map(|(key, members)| (key, members.len() as f64))
                        .collect(),
                })
            }
            (QueryShape::GroupedMean, Some(group_by)) => {
                let groups = partition(records, group_by);
                let values = groups
                    .into_iter()
                    .map(|(key, members)| {
                        let mean = mean_of(&key, members.as_slice())?;
                        Ok((key, mean))
                    })
                    .collect::<AnalyticsResult<Vec<_>>>()?;
                Ok(TrueStatistic::Grouped { values })
            }
            _ => Err(AnalyticsError::InvalidQuerySpec(format!(
                "malformed {} query",
                spec.shape.as_str()
            ))),
        }
    }

    /// Adds calibrated noise, then post-processes. Post-processing never
    /// changes the privacy cost.
    fn release_value(
        &self,
        plan: &QueryPlan<'_>,
        truth: TrueStatistic,
    ) -> AnalyticsResult<StatisticValue> {
        let epsilon = plan.per_part.epsilon();
        let delta = plan.per_part.delta();
        let sensitivity = plan.profile.sensitivity;
        match truth {
            TrueStatistic::Scalar { value } => {
                let noise = self.noise.sample(sensitivity, epsilon, delta)?;
                Ok(StatisticValue::Scalar(self.post_process(plan, value + noise)))
            }
            TrueStatistic::Grouped { values } => {
                let noise = self
                    .noise
                    .sample_independent(plan.parts, sensitivity, epsilon, delta)?;
                Ok(StatisticValue::Grouped(
                    values
                        .into_iter()
                        .zip(noise)
                        .map(|((key, value), noise)| (key, self.post_process(plan, value + noise)))
                        .collect(),
                ))
            }
        }
    }

    fn post_process(&self, plan: &QueryPlan<'_>, noisy: f64) -> f64 {
        match plan.profile.bounds {
            Some(bounds) => round_to(bounds.clamp(noisy), self.config.engine.output_precision),
            None => noisy.max(0.0).round(),
        }
    }

    fn abort(&self, reservation: Reservation, err: AnalyticsError) -> AnalyticsError {
        let cost = reservation.cost();
        let principal = reservation.principal().clone();
        reservation.rollback();
        self.count("ledger.rollbacks", 1);
        self.emit(AuditEvent::rollback(
            &principal,
            cost.epsilon(),
            cost.delta(),
            err.reason().as_str(),
        ));
        err
    }

    fn note_release(&self, principal: &Principal, fingerprint: QueryFingerprint) -> u32 {
        let mut seen = self
            .releases
            .entry((principal.clone(), fingerprint))
            .or_insert(0);
        let prior = *seen;
        *seen = seen.saturating_add(1);
        prior
    }

    fn count(&self, name: &str, delta: u64) {
        if let Err(err) = self.telemetry.record_counter(name, delta) {
            warn!(metric = name, error = %err, "failed to record counter");
        }
    }

    fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.audit.emit(event) {
            warn!(error = %err, "audit sink rejected event");
        }
    }
}

/// Splits records over the declared keys. Undeclared keys are dropped and
/// declared keys without records map to an empty group.
fn partition<'r>(
    records: &'r [CustomerRecord],
    group_by: &GroupBy,
) -> Vec<(String, Vec<&'r CustomerRecord>)> {
    let mut groups: Vec<(String, Vec<&CustomerRecord>)> = group_by
        .keys
        .iter()
        .map(|key| (key.clone(), Vec::new()))
        .collect();
    for record in records {
        let key = record.group_key(group_by.field);
        if let Some((_, members)) = groups.iter_mut().find(|(declared, _)| declared == key) {
            members.push(record);
        }
    }
    groups
}

fn check_group_domain(group_by: &GroupBy) -> AnalyticsResult<usize> {
    if group_by.keys.is_empty() {
        return Err(AnalyticsError::InvalidQuerySpec(format!(
            "grouping by {} declares no keys",
            group_by.field.as_str()
        )));
    }
    let unique: BTreeSet<&String> = group_by.keys.iter().collect();
    if unique.len() != group_by.keys.len() {
        return Err(AnalyticsError::InvalidQuerySpec(format!(
            "grouping by {} declares duplicate keys",
            group_by.field.as_str()
        )));
    }
    Ok(group_by.keys.len())
}

fn clamped_mean(members: &[&CustomerRecord], field: NumericField, bounds: &ValueBounds) -> f64 {
    let sum: f64 = members
        .iter()
        .map(|record| bounds.clamp(record.value(field)))
        .sum();
    sum / members.len() as f64
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals.min(12) as i32);
    (value * factor).round() / factor
}
