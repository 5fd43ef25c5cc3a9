use std::{fs, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{GroupField, NumericField, Predicate};

/// Depersonalized customer row. Identifying columns are stripped before
/// records reach the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub age: u32,
    pub income: f64,
    pub purchase_frequency: u32,
    pub avg_order_value: f64,
    pub region: String,
    pub product_category: String,
}

impl CustomerRecord {
    pub fn value(&self, field: NumericField) -> f64 {
        match field {
            NumericField::Income => self.income,
            NumericField::PurchaseFrequency => f64::from(self.purchase_frequency),
            NumericField::Sales => {
                self.avg_order_value * f64::from(self.purchase_frequency) / 1000.0
            }
            NumericField::Age => f64::from(self.age),
        }
    }

    pub fn group_key(&self, field: GroupField) -> &str {
        match field {
            GroupField::Region => &self.region,
            GroupField::ProductCategory => &self.product_category,
            GroupField::AgeBand => age_band(self.age),
        }
    }

    pub fn matches(&self, predicate: &Predicate) -> bool {
        predicate
            .filters
            .iter()
            .all(|(field, value)| self.group_key(*field) == value)
    }
}

/// Age buckets used by the trend age distribution.
pub const AGE_BANDS: [&str; 4] = ["18-30", "31-40", "41-50", "50+"];

pub fn age_band(age: u32) -> &'static str {
    match age {
        0..=30 => AGE_BANDS[0],
        31..=40 => AGE_BANDS[1],
        41..=50 => AGE_BANDS[2],
        _ => AGE_BANDS[3],
    }
}

#[derive(Debug, Error)]
pub enum RecordSourceError {
    #[error("record source unavailable: {0}")]
    Unavailable(String),
    #[error("record source timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("unable to read records from {path}: {details}")]
    Load { path: String, details: String },
}

/// Bounded external call yielding the records matching a predicate.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, predicate: &Predicate) -> Result<Vec<CustomerRecord>, RecordSourceError>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordSource {
    records: Arc<Vec<CustomerRecord>>,
}

impl InMemoryRecordSource {
    pub fn new(records: Vec<CustomerRecord>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    /// The five seeded customers used by demos and smoke tests.
    pub fn sample() -> Self {
        let row = |age, income, purchase_frequency, avg_order_value, region: &str, category: &str| {
            CustomerRecord {
                age,
                income,
                purchase_frequency,
                avg_order_value,
                region: region.into(),
                product_category: category.into(),
            }
        };
        Self::new(vec![
            row(35, 75_000.0, 12, 150.50, "North", "Electronics"),
            row(28, 65_000.0, 8, 89.75, "South", "Clothing"),
            row(42, 95_000.0, 15, 225.00, "West", "Home & Garden"),
            row(31, 72_000.0, 6, 75.25, "East", "Books"),
            row(38, 88_000.0, 18, 180.00, "North", "Sports"),
        ])
    }

    /// Loads a JSON array of [`CustomerRecord`]s.
    pub fn from_json_file(path: &Path) -> Result<Self, RecordSourceError> {
        let load_error = |details: String| RecordSourceError::Load {
            path: path.display().to_string(),
            details,
        };
        let contents = fs::read_to_string(path).map_err(|err| load_error(err.to_string()))?;
        let records: Vec<CustomerRecord> =
            serde_json::from_str(&contents).map_err(|err| load_error(err.to_string()))?;
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records whose `field` equals `key`. Operator-side only; never released.
    pub fn group_size(&self, field: GroupField, key: &str) -> usize {
        self.records
            .iter()
            .filter(|record| record.group_key(field) == key)
            .count()
    }
}

#[async_trait]
impl RecordSource for InMemoryRecordSource {
    async fn fetch(&self, predicate: &Predicate) -> Result<Vec<CustomerRecord>, RecordSourceError> {
        Ok(self
            .records
            .iter()
            .filter(|record| record.matches(predicate))
            .cloned()
            .collect())
    }
}
