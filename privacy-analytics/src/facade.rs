use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{AggregationEngine, NoisyStatistic, StatisticValue},
    errors::{AnalyticsError, AnalyticsResult},
    types::{GroupBy, GroupField, NumericField, Principal, QuerySpec},
};

pub const SUMMARY_GUARANTEES: &str = "Differential privacy applied to all metrics";
pub const TREND_GUARANTEES: &str = "Differential privacy applied to all demographic data";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionCount {
    pub customer_count: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerSummary {
    pub total_customers: f64,
    pub average_income: f64,
    pub average_purchase_frequency: f64,
    pub regional_breakdown: BTreeMap<String, RegionCount>,
    pub privacy_budget_used: f64,
    /// Minimum over the sub-queries.
    pub remaining_budget_fraction: f64,
    pub epsilon_spent: f64,
    pub privacy_guarantees: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendInsights {
    pub top_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_age_group: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub category_performance: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_distribution: Option<BTreeMap<String, f64>>,
    pub trend_insights: TrendInsights,
    pub privacy_budget_used: f64,
    pub remaining_budget_fraction: f64,
    pub epsilon_spent: f64,
    pub privacy_guarantees: String,
}

/// Maps the two external request shapes onto engine batches.
#[derive(Clone)]
pub struct QueryFacade {
    engine: Arc<AggregationEngine>,
}

impl QueryFacade {
    pub fn new(engine: Arc<AggregationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    /// Count, income and purchase-frequency means, and a per-region count.
    /// The mean allocation is shared evenly by the two means.
    pub fn summary_specs(&self) -> Vec<QuerySpec> {
        let facade = &self.engine.config().facade;
        let mean_epsilon = facade.summary_mean_epsilon / 2.0;
        let regions = GroupBy::new(GroupField::Region, facade.regions.iter().cloned());
        vec![
            QuerySpec::count(facade.summary_count_epsilon),
            QuerySpec::mean(NumericField::Income, mean_epsilon),
            QuerySpec::mean(NumericField::PurchaseFrequency, mean_epsilon),
            QuerySpec::grouped_count(regions, facade.summary_region_epsilon),
        ]
        .into_iter()
        .map(|spec| spec.with_delta(facade.delta))
        .collect()
    }

    pub fn trend_specs(&self) -> Vec<QuerySpec> {
        let facade = &self.engine.config().facade;
        let categories = GroupBy::new(GroupField::ProductCategory, facade.categories.iter().cloned());
        let mut specs = vec![QuerySpec::grouped_mean(
            NumericField::Sales,
            categories,
            facade.trend_category_epsilon,
        )];
        if let Some(epsilon) = facade.trend_age_epsilon {
            let bands = GroupBy::new(GroupField::AgeBand, facade.age_bands.iter().cloned());
            specs.push(QuerySpec::grouped_count(bands, epsilon));
        }
        specs
            .into_iter()
            .map(|spec| spec.with_delta(facade.delta))
            .collect()
    }

    pub async fn customer_summary(&self, principal: &Principal) -> AnalyticsResult<CustomerSummary> {
        let released = self
            .engine
            .answer_batch(principal, &self.summary_specs())
            .await?;
        let [count, income, frequency, regions] = released.as_slice() else {
            return Err(unexpected_shape("customer summary"));
        };
        let regional_breakdown = grouped(regions)?
            .iter()
            .map(|(region, customers)| {
                (
                    region.clone(),
                    RegionCount {
                        customer_count: *customers,
                    },
                )
            })
            .collect();
        Ok(CustomerSummary {
            total_customers: scalar(count)?,
            average_income: scalar(income)?,
            average_purchase_frequency: scalar(frequency)?,
            regional_breakdown,
            privacy_budget_used: budget_used(&released),
            remaining_budget_fraction: worst_remaining(&released),
            epsilon_spent: released.iter().map(|stat| stat.epsilon_spent).sum(),
            privacy_guarantees: SUMMARY_GUARANTEES.to_owned(),
        })
    }

    pub async fn trend(&self, principal: &Principal) -> AnalyticsResult<TrendReport> {
        let released = self
            .engine
            .answer_batch(principal, &self.trend_specs())
            .await?;
        let Some(categories) = released.first() else {
            return Err(unexpected_shape("trend"));
        };
        let category_performance = grouped(categories)?.clone();
        let age_distribution = released.get(1).map(grouped).transpose()?.cloned();
        let trend_insights = TrendInsights {
            top_category: arg_max(&category_performance),
            dominant_age_group: age_distribution.as_ref().and_then(arg_max),
        };
        Ok(TrendReport {
            category_performance,
            age_distribution,
            trend_insights,
            privacy_budget_used: budget_used(&released),
            remaining_budget_fraction: worst_remaining(&released),
            epsilon_spent: released.iter().map(|stat| stat.epsilon_spent).sum(),
            privacy_guarantees: TREND_GUARANTEES.to_owned(),
        })
    }
}

fn unexpected_shape(request: &str) -> AnalyticsError {
    AnalyticsError::InvalidQuerySpec(format!("unexpected release shape for {request}"))
}

fn scalar(stat: &NoisyStatistic) -> AnalyticsResult<f64> {
    stat.value
        .as_scalar()
        .ok_or_else(|| unexpected_shape(stat.shape.as_str()))
}

fn grouped(stat: &NoisyStatistic) -> AnalyticsResult<&BTreeMap<String, f64>> {
    match &stat.value {
        StatisticValue::Grouped(groups) => Ok(groups),
        StatisticValue::Scalar(_) => Err(unexpected_shape(stat.shape.as_str())),
    }
}

fn worst_remaining(released: &[NoisyStatistic]) -> f64 {
    released
        .iter()
        .map(|stat| stat.remaining_budget_fraction)
        .fold(1.0, f64::min)
}

fn budget_used(released: &[NoisyStatistic]) -> f64 {
    released
        .iter()
        .map(|stat| stat.privacy_budget_used)
        .fold(0.0, f64::max)
}

// Ties resolve to the first key in order.
fn arg_max(values: &BTreeMap<String, f64>) -> Option<String> {
    values
        .iter()
        .fold(None, |best: Option<(&String, f64)>, (key, value)| match best {
            Some((_, top)) if top >= *value => best,
            _ => Some((key, *value)),
        })
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::NoopAuditSink, config::AnalyticsConfig, noise::NoiseMechanism,
        noise::SeededNoise, records::InMemoryRecordSource,
    };

    fn facade(config: AnalyticsConfig) -> QueryFacade {
        let engine = AggregationEngine::new(
            config,
            Arc::new(InMemoryRecordSource::sample()),
            NoiseMechanism::new(Arc::new(SeededNoise::new(3))),
            Arc::new(NoopAuditSink),
        )
        .unwrap();
        QueryFacade::new(Arc::new(engine))
    }

    #[test]
    fn summary_specs_split_mean_allocation() {
        let specs = facade(AnalyticsConfig::sample()).summary_specs();
        let total: f64 = specs.iter().map(|spec| spec.requested_epsilon).sum();
        assert_eq!(specs.len(), 4);
        assert!((specs[1].requested_epsilon - 0.05).abs() < 1e-12);
        assert!((total - 0.3).abs() < 1e-12);
    }

    #[test]
    fn trend_specs_include_age_bands_only_when_configured() {
        let mut config = AnalyticsConfig::sample();
        assert_eq!(facade(config.clone()).trend_specs().len(), 1);
        config.facade.trend_age_epsilon = Some(0.1);
        let specs = facade(config).trend_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].group_by.as_ref().unwrap().keys.len(), 4);
    }

    #[tokio::test]
    async fn summary_on_sample_records() {
        let mut config = AnalyticsConfig::sample();
        config.sensitivity.min_group_size = 5;
        let facade = facade(config);
        let summary = facade.customer_summary(&Principal::new("analyst")).await.unwrap();
        assert_eq!(summary.regional_breakdown.len(), 4);
        assert!(summary.total_customers >= 0.0);
        assert!((0.0..=250_000.0).contains(&summary.average_income));
        assert!((summary.privacy_budget_used - 0.3).abs() < 1e-9);
        assert!((summary.remaining_budget_fraction - 0.7).abs() < 1e-9);
        assert_eq!(summary.privacy_guarantees, SUMMARY_GUARANTEES);
    }

    #[test]
    fn arg_max_prefers_first_on_ties() {
        let values = BTreeMap::from([
            ("Books".to_string(), 3.0),
            ("Clothing".to_string(), 3.0),
            ("Sports".to_string(), 1.0),
        ]);
        assert_eq!(arg_max(&values), Some("Books".to_string()));
        assert_eq!(arg_max(&BTreeMap::new()), None);
    }
}
