//! Fallback dispatch: only empty primary cases reach the fallback source.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use ewb_core::fakes::{chained_model, dated_case, MemoryOpener, ScriptedEvaluator};
use ewb_core::{
    CaseCollection, CaseId, CheckpointKey, CheckpointStore, Driver, EvaluationError,
    EvaluationSpec, EventType, MetricSample, ModelRegistry, OutcomeCounts, RecordValue,
    ResolutionStrategy, ResultAggregator, SourceResolver, UnitState,
};

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn ten_cases() -> CaseCollection {
    (1..=10)
        .map(|i| dated_case(i, d("2022-06-01"), d("2022-06-08")))
        .collect()
}

fn specs() -> Vec<EvaluationSpec> {
    vec![EvaluationSpec::new(
        EventType::HeatWave,
        &["root_mean_squared_error"],
        "ERA5",
    )]
}

struct Setup {
    _dir: tempfile::TempDir,
    driver: Driver,
    library: Arc<ScriptedEvaluator>,
}

fn setup(library: ScriptedEvaluator) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new(vec![chained_model(
        "hres",
        ResolutionStrategy::Fallback,
        &["HRES zarr", "HRES arraylake"],
    )])
    .unwrap();
    let resolver = Arc::new(SourceResolver::new(
        Arc::new(registry),
        Arc::new(MemoryOpener::new()),
    ));
    let library = Arc::new(library);
    let driver = Driver::new(
        resolver,
        library.clone(),
        CheckpointStore::new(dir.path().join("saved_data")),
        ten_cases(),
        specs(),
    );
    Setup {
        _dir: dir,
        driver,
        library,
    }
}

#[tokio::test]
async fn three_empty_primaries_cause_exactly_three_fallback_calls() {
    let empty: BTreeSet<CaseId> = [CaseId(2), CaseId(5), CaseId(9)].into();
    let mut library = ScriptedEvaluator::new()
        .with_default("HRES zarr", vec![MetricSample::new("root_mean_squared_error", Some(24), 1.0)])
        .with_default(
            "HRES arraylake",
            vec![MetricSample::new("root_mean_squared_error", Some(24), 2.0)],
        );
    for id in &empty {
        library = library.with_empty("HRES zarr", *id);
    }
    let s = setup(library);

    let report = s
        .driver
        .run_batch(&["hres".to_string()], EventType::HeatWave)
        .await
        .unwrap();

    assert_eq!(s.library.calls_for("HRES zarr").len(), 10);
    let fallback_calls: BTreeSet<CaseId> =
        s.library.calls_for("HRES arraylake").into_iter().collect();
    assert_eq!(s.library.calls_for("HRES arraylake").len(), 3);
    assert_eq!(fallback_calls, empty);

    let unit = report.unit("hres").unwrap();
    assert_eq!(unit.state, UnitState::Checkpointed);
    assert_eq!(
        unit.history,
        vec![
            UnitState::Pending,
            UnitState::Running,
            UnitState::PartialEmpty,
            UnitState::FallbackRunning,
            UnitState::Success,
            UnitState::Checkpointed,
        ]
    );
    assert_eq!(
        unit.counts,
        OutcomeCounts {
            success: 10,
            empty: 0,
            failed: 0
        }
    );

    // The fallback rows carry the fallback source name.
    let table = s
        .driver
        .store()
        .load(&CheckpointKey::new("hres", EventType::HeatWave))
        .unwrap()
        .unwrap();
    for outcome in ResultAggregator::outcomes(&table) {
        let expected = if empty.contains(&outcome.case_id) {
            "HRES arraylake"
        } else {
            "HRES zarr"
        };
        assert_eq!(outcome.forecast_source, expected);
    }
}

#[tokio::test]
async fn failed_primary_case_is_not_retried_on_fallback() {
    let s = setup(
        ScriptedEvaluator::new()
            .with_default("HRES zarr", vec![MetricSample::new("root_mean_squared_error", Some(24), 1.0)])
            .with_error(
                "HRES zarr",
                CaseId(4),
                EvaluationError::Library("missing variable 2m_temperature".into()),
            )
            .with_panic("HRES zarr", CaseId(7)),
    );

    let report = s
        .driver
        .run_batch(&["hres".to_string()], EventType::HeatWave)
        .await
        .unwrap();

    assert!(s.library.calls_for("HRES arraylake").is_empty());
    let unit = report.unit("hres").unwrap();
    assert_eq!(unit.state, UnitState::Checkpointed);
    assert_eq!(
        unit.counts,
        OutcomeCounts {
            success: 8,
            empty: 0,
            failed: 2
        }
    );
}

#[tokio::test]
async fn empty_after_every_source_is_kept_as_marker() {
    let s = setup(
        ScriptedEvaluator::new()
            .with_default("HRES zarr", vec![MetricSample::new("root_mean_squared_error", Some(24), 1.0)])
            .with_empty("HRES zarr", CaseId(3)),
    );

    let report = s
        .driver
        .run_batch(&["hres".to_string()], EventType::HeatWave)
        .await
        .unwrap();
    assert_eq!(s.library.calls_for("HRES arraylake"), vec![CaseId(3)]);
    assert_eq!(report.unit("hres").unwrap().counts.empty, 1);

    let table = s
        .driver
        .store()
        .load(&CheckpointKey::new("hres", EventType::HeatWave))
        .unwrap()
        .unwrap();
    let markers: Vec<_> = table
        .records_for_case(CaseId(3))
        .map(|(key, value)| (key.metric.clone(), value.clone()))
        .collect();
    assert_eq!(markers, vec![(None, RecordValue::Empty)]);
}

#[tokio::test]
async fn repeated_sample_fails_only_its_own_case() {
    let s = setup(
        ScriptedEvaluator::new()
            .with_default("HRES zarr", vec![MetricSample::new("root_mean_squared_error", Some(24), 1.0)])
            .with_samples(
                "HRES zarr",
                CaseId(7),
                vec![
                    MetricSample::new("root_mean_squared_error", Some(24), 1.0),
                    MetricSample::new("root_mean_squared_error", Some(24), 1.3),
                ],
            ),
    );

    let report = s
        .driver
        .run_batch(&["hres".to_string()], EventType::HeatWave)
        .await
        .unwrap();

    let unit = report.unit("hres").unwrap();
    assert_eq!(unit.state, UnitState::Checkpointed);
    assert_eq!(
        unit.counts,
        OutcomeCounts {
            success: 9,
            empty: 0,
            failed: 1
        }
    );
    // A failed case is not an empty one.
    assert!(s.library.calls_for("HRES arraylake").is_empty());

    let table = s
        .driver
        .store()
        .load(&CheckpointKey::new("hres", EventType::HeatWave))
        .unwrap()
        .unwrap();
    let case_seven: Vec<_> = table.records_for_case(CaseId(7)).collect();
    assert_eq!(case_seven.len(), 1);
    assert!(matches!(case_seven[0].1, RecordValue::Failed { error } if error.contains("reported twice")));
    assert_eq!(table.case_ids().len(), 10);
}

#[tokio::test]
async fn non_finite_scores_survive_the_checkpoint() {
    let s = setup(
        ScriptedEvaluator::new()
            .with_default("HRES zarr", vec![MetricSample::new("root_mean_squared_error", Some(24), 1.0)])
            .with_samples(
                "HRES zarr",
                CaseId(4),
                vec![
                    MetricSample::new("critical_success_index", Some(24), f64::NAN),
                    MetricSample::new("false_alarm_ratio", Some(24), f64::INFINITY),
                ],
            ),
    );

    let report = s
        .driver
        .run_batch(&["hres".to_string()], EventType::HeatWave)
        .await
        .unwrap();
    let unit = report.unit("hres").unwrap();
    assert_eq!(unit.state, UnitState::Checkpointed);
    assert_eq!(unit.counts.success, 10);

    let table = s
        .driver
        .store()
        .load(&CheckpointKey::new("hres", EventType::HeatWave))
        .unwrap()
        .unwrap();
    let values: Vec<f64> = table
        .records_for_case(CaseId(4))
        .filter_map(|(_, value)| match value {
            RecordValue::Value { value } => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(values.len(), 2);
    assert!(values[0].is_nan());
    assert_eq!(values[1], f64::INFINITY);

    // A second run resumes from the file instead of recomputing.
    let again = s
        .driver
        .run_batch(&["hres".to_string()], EventType::HeatWave)
        .await
        .unwrap();
    assert!(again.unit("hres").unwrap().resumed);
}
