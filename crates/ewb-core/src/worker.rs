//! One unit of work: a single case evaluated against a single source.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::domain::{
    Case, CaseId, EvaluationError, EvaluationSpec, MetricSample, RecordValue, ResultKey,
    ResultRecord,
};
use crate::source::Source;

/// The external evaluation library, seen from one case.
///
/// May be slow. Returning an empty vector is legitimate and means the source
/// has no usable data for the case.
#[async_trait]
pub trait EvaluationLibrary: Send + Sync {
    async fn run_pipeline(
        &self,
        case: &Case,
        spec: &EvaluationSpec,
        source: &dyn Source,
    ) -> Result<Vec<MetricSample>, EvaluationError>;
}

/// What happened to one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseResult {
    Success { samples: Vec<MetricSample> },
    /// No data for this case; the trigger for fallback.
    Empty,
    /// The evaluation raised for this case only.
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeStatus {
    Success,
    Empty,
    Failed,
}

/// Per-case result, attributed by `case_id`, never by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub case_id: CaseId,
    pub forecast_source: String,
    pub target_source: String,
    pub result: CaseResult,
}

impl Outcome {
    /// Build an outcome from library samples. No samples means `Empty`.
    pub fn from_samples(
        case_id: CaseId,
        forecast_source: impl Into<String>,
        target_source: impl Into<String>,
        samples: Vec<MetricSample>,
    ) -> Self {
        let result = if samples.is_empty() {
            CaseResult::Empty
        } else {
            CaseResult::Success { samples }
        };
        Self {
            case_id,
            forecast_source: forecast_source.into(),
            target_source: target_source.into(),
            result,
        }
    }

    pub fn empty(
        case_id: CaseId,
        forecast_source: impl Into<String>,
        target_source: impl Into<String>,
    ) -> Self {
        Self::from_samples(case_id, forecast_source, target_source, Vec::new())
    }

    pub fn failed(
        case_id: CaseId,
        forecast_source: impl Into<String>,
        target_source: impl Into<String>,
        error: impl ToString,
    ) -> Self {
        Self {
            case_id,
            forecast_source: forecast_source.into(),
            target_source: target_source.into(),
            result: CaseResult::Failed {
                error: error.to_string(),
            },
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        match self.result {
            CaseResult::Success { .. } => OutcomeStatus::Success,
            CaseResult::Empty => OutcomeStatus::Empty,
            CaseResult::Failed { .. } => OutcomeStatus::Failed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status() == OutcomeStatus::Empty
    }

    /// Result records for this outcome. Empty and failed cases produce one
    /// marker record with no metric and no lead time.
    pub fn to_records(&self) -> Vec<ResultRecord> {
        let key = |metric: Option<String>, lead_time| ResultKey {
            case_id: self.case_id,
            forecast_source: self.forecast_source.clone(),
            target_source: self.target_source.clone(),
            metric,
            lead_time,
        };
        match &self.result {
            CaseResult::Success { samples } => samples
                .iter()
                .map(|s| ResultRecord {
                    key: key(Some(s.metric.clone()), s.lead_time),
                    value: RecordValue::Value { value: s.value },
                })
                .collect(),
            CaseResult::Empty => vec![ResultRecord {
                key: key(None, None),
                value: RecordValue::Empty,
            }],
            CaseResult::Failed { error } => vec![ResultRecord {
                key: key(None, None),
                value: RecordValue::Failed {
                    error: error.clone(),
                },
            }],
        }
    }
}

/// Runs the evaluation library for one case. Holds no mutable state, so a
/// clone per task is free.
#[derive(Clone)]
pub struct CaseWorker {
    library: Arc<dyn EvaluationLibrary>,
}

impl CaseWorker {
    pub fn new(library: Arc<dyn EvaluationLibrary>) -> Self {
        Self { library }
    }

    #[instrument(skip_all, fields(case_id = %case.case_id, source = %source.name()))]
    pub async fn run(&self, case: &Case, spec: &EvaluationSpec, source: &dyn Source) -> Outcome {
        match self.library.run_pipeline(case, spec, source).await {
            Ok(samples) => {
                if let Some(dup) = duplicate_sample(&samples) {
                    let error = EvaluationError::MalformedOutput(format!(
                        "metric {} reported twice at lead time {}",
                        dup.metric,
                        dup.lead_time
                            .map(|l| l.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    ));
                    warn!(error = %error, "case evaluation failed");
                    return Outcome::failed(case.case_id, source.name(), spec.target_name(), error);
                }
                debug!(samples = samples.len(), "case evaluated");
                Outcome::from_samples(case.case_id, source.name(), spec.target_name(), samples)
            }
            Err(e) => {
                warn!(error = %e, "case evaluation failed");
                Outcome::failed(case.case_id, source.name(), spec.target_name(), e)
            }
        }
    }
}

/// First sample whose `(metric, lead_time)` was already seen.
fn duplicate_sample(samples: &[MetricSample]) -> Option<&MetricSample> {
    let mut seen = HashSet::new();
    samples
        .iter()
        .find(|s| !seen.insert((s.metric.as_str(), s.lead_time)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;
    use crate::fakes::{memory_source, sample_case, ScriptedEvaluator};

    fn spec() -> EvaluationSpec {
        EvaluationSpec::new(EventType::HeatWave, &["rmse"], "ERA5")
    }

    #[tokio::test]
    async fn test_samples_are_success() {
        let source = memory_source("hres", "primary");
        let library = ScriptedEvaluator::new()
            .with_samples("primary", CaseId(1), vec![MetricSample::new("rmse", Some(24), 1.5)]);
        let worker = CaseWorker::new(Arc::new(library));

        let outcome = worker.run(&sample_case(1), &spec(), source.as_ref()).await;
        assert_eq!(outcome.status(), OutcomeStatus::Success);
        assert_eq!(outcome.forecast_source, "primary");
        assert_eq!(outcome.target_source, "ERA5");
    }

    #[tokio::test]
    async fn test_no_samples_is_empty_not_failed() {
        let source = memory_source("hres", "primary");
        let worker = CaseWorker::new(Arc::new(ScriptedEvaluator::new()));

        let outcome = worker.run(&sample_case(7), &spec(), source.as_ref()).await;
        assert_eq!(outcome.status(), OutcomeStatus::Empty);
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn test_library_error_is_failed() {
        let source = memory_source("hres", "primary");
        let library = ScriptedEvaluator::new().with_error(
            "primary",
            CaseId(3),
            EvaluationError::Library("missing variable t2m".into()),
        );
        let worker = CaseWorker::new(Arc::new(library));

        let outcome = worker.run(&sample_case(3), &spec(), source.as_ref()).await;
        match outcome.result {
            CaseResult::Failed { error } => assert!(error.contains("missing variable t2m")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repeated_metric_and_lead_time_fails_the_case() {
        let source = memory_source("hres", "primary");
        let library = ScriptedEvaluator::new().with_samples(
            "primary",
            CaseId(7),
            vec![
                MetricSample::new("rmse", Some(24), 1.0),
                MetricSample::new("rmse", Some(48), 1.1),
                MetricSample::new("rmse", Some(24), 1.2),
            ],
        );
        let worker = CaseWorker::new(Arc::new(library));

        let outcome = worker.run(&sample_case(7), &spec(), source.as_ref()).await;
        match &outcome.result {
            CaseResult::Failed { error } => {
                assert!(error.contains("rmse reported twice at lead time 24h"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(outcome.to_records().len(), 1);
    }

    #[test]
    fn test_same_metric_at_other_lead_times_is_not_a_duplicate() {
        let samples = vec![
            MetricSample::new("rmse", Some(24), 1.0),
            MetricSample::new("rmse", None, 1.0),
            MetricSample::new("mae", Some(24), 1.0),
        ];
        assert!(duplicate_sample(&samples).is_none());
    }

    #[test]
    fn test_marker_records_have_no_metric() {
        let empty = Outcome::empty(CaseId(4), "HRES", "ERA5").to_records();
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].key.metric, None);
        assert_eq!(empty[0].value, RecordValue::Empty);

        let failed = Outcome::failed(CaseId(4), "HRES", "ERA5", "boom").to_records();
        assert_eq!(
            failed[0].value,
            RecordValue::Failed {
                error: "boom".into()
            }
        );
    }

    #[test]
    fn test_success_records_one_per_sample() {
        let outcome = Outcome::from_samples(
            CaseId(2),
            "HRES",
            "GHCN",
            vec![
                MetricSample::new("rmse", Some(0), 1.0),
                MetricSample::new("rmse", Some(24), 2.0),
            ],
        );
        let records = outcome.to_records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.key.target_source == "GHCN"));
    }
}
