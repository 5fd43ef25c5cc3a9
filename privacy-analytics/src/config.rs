use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use privacy_analytics_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    budget::PrivacyCost, records::AGE_BANDS, sensitivity::ValueBounds, types::NumericField,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub sensitivity: SensitivityConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub facade: FacadeConfig,
    #[serde(default = "default_telemetry")]
    pub telemetry: TelemetryConfig,
}

/// Ceiling applied to principals created lazily on first query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BudgetConfig {
    #[serde(default = "default_total_epsilon")]
    pub total_epsilon: f64,
    #[serde(default)]
    pub total_delta: f64,
    /// Spend resets once this many seconds have passed since the window opened.
    #[serde(default)]
    pub window_secs: Option<u64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_epsilon: default_total_epsilon(),
            total_delta: 0.0,
            window_secs: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SensitivityConfig {
    #[serde(default = "default_min_group_size")]
    pub min_group_size: u32,
    #[serde(default)]
    pub bounds: FieldBounds,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            min_group_size: default_min_group_size(),
            bounds: FieldBounds::default(),
        }
    }
}

/// Declared value domain of every numeric field.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FieldBounds {
    #[serde(default = "default_income_bounds")]
    pub income: ValueBounds,
    #[serde(default = "default_purchase_frequency_bounds")]
    pub purchase_frequency: ValueBounds,
    #[serde(default = "default_sales_bounds")]
    pub sales: ValueBounds,
    #[serde(default = "default_age_bounds")]
    pub age: ValueBounds,
}

impl FieldBounds {
    pub fn for_field(&self, field: NumericField) -> ValueBounds {
        match field {
            NumericField::Income => self.income,
            NumericField::PurchaseFrequency => self.purchase_frequency,
            NumericField::Sales => self.sales,
            NumericField::Age => self.age,
        }
    }
}

impl Default for FieldBounds {
    fn default() -> Self {
        Self {
            income: default_income_bounds(),
            purchase_frequency: default_purchase_frequency_bounds(),
            sales: default_sales_bounds(),
            age: default_age_bounds(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default = "default_record_source_timeout_ms")]
    pub record_source_timeout_ms: u64,
    /// Decimal places kept on released means.
    #[serde(default = "default_output_precision")]
    pub output_precision: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            record_source_timeout_ms: default_record_source_timeout_ms(),
            output_precision: default_output_precision(),
        }
    }
}

/// Epsilon allocations and group domains behind the two request shapes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FacadeConfig {
    #[serde(default = "default_sub_query_epsilon")]
    pub summary_count_epsilon: f64,
    /// Shared evenly by the income and purchase-frequency means.
    #[serde(default = "default_sub_query_epsilon")]
    pub summary_mean_epsilon: f64,
    #[serde(default = "default_sub_query_epsilon")]
    pub summary_region_epsilon: f64,
    #[serde(default = "default_trend_category_epsilon")]
    pub trend_category_epsilon: f64,
    /// Age distribution is only released when set.
    #[serde(default)]
    pub trend_age_epsilon: Option<f64>,
    #[serde(default)]
    pub delta: f64,
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default = "default_age_bands")]
    pub age_bands: Vec<String>,
}

impl FacadeConfig {
    pub fn summary_epsilon(&self) -> f64 {
        self.summary_count_epsilon + self.summary_mean_epsilon + self.summary_region_epsilon
    }

    pub fn trend_epsilon(&self) -> f64 {
        self.trend_category_epsilon + self.trend_age_epsilon.unwrap_or(0.0)
    }
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            summary_count_epsilon: default_sub_query_epsilon(),
            summary_mean_epsilon: default_sub_query_epsilon(),
            summary_region_epsilon: default_sub_query_epsilon(),
            trend_category_epsilon: default_trend_category_epsilon(),
            trend_age_epsilon: None,
            delta: 0.0,
            regions: default_regions(),
            categories: default_categories(),
            age_bands: default_age_bands(),
        }
    }
}

const fn default_total_epsilon() -> f64 {
    1.0
}

const fn default_min_group_size() -> u32 {
    5
}

const fn default_income_bounds() -> ValueBounds {
    ValueBounds {
        lo: 0.0,
        hi: 250_000.0,
    }
}

const fn default_purchase_frequency_bounds() -> ValueBounds {
    ValueBounds { lo: 0.0, hi: 52.0 }
}

const fn default_sales_bounds() -> ValueBounds {
    ValueBounds { lo: 0.0, hi: 25.0 }
}

const fn default_age_bounds() -> ValueBounds {
    ValueBounds {
        lo: 18.0,
        hi: 100.0,
    }
}

const fn default_record_source_timeout_ms() -> u64 {
    2_000
}

const fn default_output_precision() -> u32 {
    2
}

const fn default_sub_query_epsilon() -> f64 {
    0.1
}

const fn default_trend_category_epsilon() -> f64 {
    0.4
}

fn default_regions() -> Vec<String> {
    ["North", "South", "East", "West"].map(String::from).to_vec()
}

fn default_categories() -> Vec<String> {
    ["Electronics", "Clothing", "Home & Garden", "Books", "Sports"]
        .map(String::from)
        .to_vec()
}

fn default_age_bands() -> Vec<String> {
    AGE_BANDS.map(String::from).to_vec()
}

fn default_telemetry() -> TelemetryConfig {
    TelemetryConfig::sample("privacy-analytics")
}

fn check_epsilon(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "{name} must be a finite value > 0 (got {value})"
        )))
    }
}

fn check_domain(name: &str, keys: &[String]) -> Result<(), ConfigError> {
    if keys.is_empty() {
        return Err(ConfigError::Validation(format!("{name} must not be empty")));
    }
    let unique: BTreeSet<&String> = keys.iter().collect();
    if unique.len() != keys.len() {
        return Err(ConfigError::Validation(format!(
            "{name} contains duplicate keys"
        )));
    }
    Ok(())
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_epsilon("budget.total-epsilon", self.budget.total_epsilon)?;
        if !(0.0..1.0).contains(&self.budget.total_delta) {
            return Err(ConfigError::Validation(format!(
                "budget.total-delta must be within [0, 1) (got {})",
                self.budget.total_delta
            )));
        }
        PrivacyCost::new(self.budget.total_epsilon, self.budget.total_delta).map_err(|err| {
            ConfigError::Validation(format!("budget ceiling is not representable: {err}"))
        })?;
        if self.budget.window_secs == Some(0) {
            return Err(ConfigError::Validation(
                "budget.window-secs must be greater than zero".into(),
            ));
        }
        if self.sensitivity.min_group_size == 0 {
            return Err(ConfigError::Validation(
                "sensitivity.min-group-size must be at least 1".into(),
            ));
        }
        for field in [
            NumericField::Income,
            NumericField::PurchaseFrequency,
            NumericField::Sales,
            NumericField::Age,
        ] {
            self.sensitivity
                .bounds
                .for_field(field)
                .validate()
                .map_err(|err| {
                    ConfigError::Validation(format!("bounds for {}: {err}", field.as_str()))
                })?;
        }
        if self.engine.record_source_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.record-source-timeout-ms must be greater than zero".into(),
            ));
        }
        if self.engine.output_precision > 12 {
            return Err(ConfigError::Validation(
                "engine.output-precision cannot exceed 12".into(),
            ));
        }
        let facade = &self.facade;
        check_epsilon("facade.summary-count-epsilon", facade.summary_count_epsilon)?;
        check_epsilon("facade.summary-mean-epsilon", facade.summary_mean_epsilon)?;
        check_epsilon("facade.summary-region-epsilon", facade.summary_region_epsilon)?;
        check_epsilon("facade.trend-category-epsilon", facade.trend_category_epsilon)?;
        if let Some(epsilon) = facade.trend_age_epsilon {
            check_epsilon("facade.trend-age-epsilon", epsilon)?;
        }
        if !(0.0..1.0).contains(&facade.delta) {
            return Err(ConfigError::Validation(format!(
                "facade.delta must be within [0, 1) (got {})",
                facade.delta
            )));
        }
        if facade.delta > 0.0 && self.budget.total_delta == 0.0 {
            return Err(ConfigError::Validation(
                "facade.delta requires a non-zero budget.total-delta".into(),
            ));
        }
        check_domain("facade.regions", &facade.regions)?;
        check_domain("facade.categories", &facade.categories)?;
        check_domain("facade.age-bands", &facade.age_bands)?;
        if !(1..=5).contains(&self.telemetry.histogram_precision) {
            return Err(ConfigError::Validation(
                "telemetry.histogram-precision must be within 1..=5".into(),
            ));
        }
        if self.telemetry.max_latency_ms < self.engine.record_source_timeout_ms {
            return Err(ConfigError::Validation(
                "telemetry.max-latency-ms must cover engine.record-source-timeout-ms".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            budget: BudgetConfig::default(),
            sensitivity: SensitivityConfig::default(),
            engine: EngineConfig::default(),
            facade: FacadeConfig::default(),
            telemetry: default_telemetry(),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self::sample()
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<AnalyticsConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, format: ConfigFormat) -> Result<AnalyticsConfig, ConfigError> {
    let parse_error = |details: String| ConfigError::Parse { format, details };
    match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(contents).map_err(|err| parse_error(err.to_string()))
        }
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| parse_error(err.to_string()))
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
