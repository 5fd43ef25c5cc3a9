use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

/// Budget holder: a user, session or tenant as asserted by the host.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryShape {
    Count,
    Mean,
    GroupedCount,
    GroupedMean,
}

impl QueryShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryShape::Count => "count",
            QueryShape::Mean => "mean",
            QueryShape::GroupedCount => "grouped_count",
            QueryShape::GroupedMean => "grouped_mean",
        }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self, QueryShape::GroupedCount | QueryShape::GroupedMean)
    }

    pub fn is_mean(&self) -> bool {
        matches!(self, QueryShape::Mean | QueryShape::GroupedMean)
    }
}

/// Numeric columns a mean can be taken over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericField {
    Income,
    PurchaseFrequency,
    /// `avg_order_value * purchase_frequency / 1000`.
    Sales,
    Age,
}

impl NumericField {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumericField::Income => "income",
            NumericField::PurchaseFrequency => "purchase_frequency",
            NumericField::Sales => "sales",
            NumericField::Age => "age",
        }
    }
}

/// Categorical columns records can be grouped or filtered by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupField {
    Region,
    ProductCategory,
    AgeBand,
}

impl GroupField {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupField::Region => "region",
            GroupField::ProductCategory => "product_category",
            GroupField::AgeBand => "age_band",
        }
    }
}

/// Equality filters restricting the record subset a query runs over.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<(GroupField, String)>,
}

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: GroupField, value: impl Into<String>) -> Self {
        self.filters.push((field, value.into()));
        self
    }
}

/// Grouping with a declared, public key domain. Only declared keys are
/// released and the epsilon split is fixed by the number of keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupBy {
    pub field: GroupField,
    pub keys: Vec<String>,
}

impl GroupBy {
    pub fn new<I, S>(field: GroupField, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Immutable description of one aggregation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub shape: QueryShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measure: Option<NumericField>,
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<GroupBy>,
    pub requested_epsilon: f64,
    #[serde(default)]
    pub requested_delta: f64,
}

impl QuerySpec {
    pub fn count(epsilon: f64) -> Self {
        Self {
            shape: QueryShape::Count,
            measure: None,
            predicate: Predicate::all(),
            group_by: None,
            requested_epsilon: epsilon,
            requested_delta: 0.0,
        }
    }

    pub fn mean(measure: NumericField, epsilon: f64) -> Self {
        Self {
            shape: QueryShape::Mean,
            measure: Some(measure),
            ..Self::count(epsilon)
        }
    }

    pub fn grouped_count(group_by: GroupBy, epsilon: f64) -> Self {
        Self {
            shape: QueryShape::GroupedCount,
            group_by: Some(group_by),
            ..Self::count(epsilon)
        }
    }

    pub fn grouped_mean(measure: NumericField, group_by: GroupBy, epsilon: f64) -> Self {
        Self {
            shape: QueryShape::GroupedMean,
            measure: Some(measure),
            group_by: Some(group_by),
            ..Self::count(epsilon)
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.requested_delta = delta;
        self
    }

    /// Identity of the question asked, independent of the budget spent on it.
    pub fn fingerprint(&self) -> QueryFingerprint {
        let mut hasher = Hasher::new();
        hasher.update(self.shape.as_str().as_bytes());
        hasher.update(&[0xff]);
        if let Some(measure) = self.measure {
            hasher.update(measure.as_str().as_bytes());
        }
        hasher.update(&[0xff]);
        for (field, value) in &self.predicate.filters {
            hasher.update(field.as_str().as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(&[0x00]);
        }
        hasher.update(&[0xff]);
        if let Some(group_by) = &self.group_by {
            hasher.update(group_by.field.as_str().as_bytes());
            for key in &group_by.keys {
                hasher.update(&[0x00]);
                hasher.update(key.as_bytes());
            }
        }
        QueryFingerprint(*hasher.finalize().as_bytes())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryFingerprint(pub [u8; 32]);

impl QueryFingerprint {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

impl fmt::Debug for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryFingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
