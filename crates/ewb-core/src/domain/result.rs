//! Result records and tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::case::CaseId;
use super::error::AggregationError;

/// Forecast horizon in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadTime(pub i64);

impl fmt::Display for LeadTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.0)
    }
}

/// One metric value as returned by the evaluation library.
///
/// `value` may be NaN or infinite (a CSI with no observed events, say).
/// Such values serialize as the strings `"NaN"`, `"Infinity"` and
/// `"-Infinity"`, and compare equal to themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    #[serde(default)]
    pub lead_time: Option<LeadTime>,
    #[serde(with = "metric_value")]
    pub value: f64,
}

impl PartialEq for MetricSample {
    fn eq(&self, other: &Self) -> bool {
        self.metric == other.metric
            && self.lead_time == other.lead_time
            && same_value(self.value, other.value)
    }
}

impl MetricSample {
    pub fn new(metric: impl Into<String>, lead_time: Option<i64>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            lead_time: lead_time.map(LeadTime),
            value,
        }
    }
}

/// Identity of a result record.
///
/// Marker records for empty or failed cases have `metric == None` and
/// `lead_time == None`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub case_id: CaseId,
    pub forecast_source: String,
    pub target_source: String,
    pub metric: Option<String>,
    pub lead_time: Option<LeadTime>,
}

impl ResultKey {
    /// Key used to detect overlap between date partitions. Ignores the
    /// forecast name since partitions may be served by differently named
    /// archives of the same model.
    fn partition_key(&self) -> (CaseId, &str, Option<&str>, Option<LeadTime>) {
        (
            self.case_id,
            self.target_source.as_str(),
            self.metric.as_deref(),
            self.lead_time,
        )
    }
}

/// Value of a result record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordValue {
    Value {
        #[serde(with = "metric_value")]
        value: f64,
    },
    /// The source had no data for this case.
    Empty,
    /// The evaluation raised for this case.
    Failed { error: String },
}

impl PartialEq for RecordValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value { value: a }, Self::Value { value: b }) => same_value(*a, *b),
            (Self::Empty, Self::Empty) => true,
            (Self::Failed { error: a }, Self::Failed { error: b }) => a == b,
            _ => false,
        }
    }
}

/// Equality under which NaN matches NaN.
fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Serde adapter for metric values. JSON has no NaN or infinity, so those
/// travel as strings. Finite values stay plain numbers.
pub(crate) mod metric_value {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "Infinity" } else { "-Infinity" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Token(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(value),
            // `str::parse` accepts nan/inf/infinity in any case, with sign.
            Raw::Token(token) => token
                .parse::<f64>()
                .ok()
                .filter(|value| !value.is_finite())
                .ok_or_else(|| de::Error::custom(format!("invalid metric value {token:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub key: ResultKey,
    pub value: RecordValue,
}

/// A set of result records with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ResultRecord>", into = "Vec<ResultRecord>")]
pub struct ResultTable {
    records: BTreeMap<ResultKey, RecordValue>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &ResultKey) -> Option<&RecordValue> {
        self.records.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResultKey, &RecordValue)> {
        self.records.iter()
    }

    pub fn case_ids(&self) -> Vec<CaseId> {
        let mut ids: Vec<CaseId> = self.records.keys().map(|k| k.case_id).collect();
        ids.dedup();
        ids
    }

    /// Records belonging to one case, in key order.
    pub fn records_for_case(&self, case_id: CaseId) -> impl Iterator<Item = (&ResultKey, &RecordValue)> {
        self.records
            .iter()
            .filter(move |(k, _)| k.case_id == case_id)
    }

    /// Insert a record, rejecting an existing key.
    pub fn insert(&mut self, record: ResultRecord) -> Result<(), AggregationError> {
        if self.records.contains_key(&record.key) {
            return Err(duplicate(&record.key));
        }
        self.records.insert(record.key, record.value);
        Ok(())
    }

    /// Concatenate tables from disjoint date partitions.
    ///
    /// Fails on the first `(case, target, metric, lead time)` present in both.
    pub fn union_partitions(a: ResultTable, b: ResultTable) -> Result<ResultTable, AggregationError> {
        let clash = {
            let seen: BTreeSet<_> = a.records.keys().map(|k| k.partition_key()).collect();
            b.records
                .keys()
                .find(|k| seen.contains(&k.partition_key()))
                .cloned()
        };
        if let Some(clash) = clash {
            return Err(duplicate(&clash));
        }
        let mut merged = a;
        merged.records.extend(b.records);
        Ok(merged)
    }
}

fn duplicate(key: &ResultKey) -> AggregationError {
    AggregationError::DuplicateKey {
        case_id: key.case_id,
        target_source: key.target_source.clone(),
        metric: key.metric.clone().unwrap_or_else(|| "<marker>".to_string()),
        lead_time: key
            .lead_time
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string()),
    }
}

impl TryFrom<Vec<ResultRecord>> for ResultTable {
    type Error = AggregationError;

    fn try_from(records: Vec<ResultRecord>) -> Result<Self, Self::Error> {
        let mut table = ResultTable::new();
        for record in records {
            table.insert(record)?;
        }
        Ok(table)
    }
}

impl From<ResultTable> for Vec<ResultRecord> {
    fn from(table: ResultTable) -> Self {
        table
            .records
            .into_iter()
            .map(|(key, value)| ResultRecord { key, value })
            .collect()
    }
}
