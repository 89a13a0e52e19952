//! Restarting a batch after a crash picks up at the last checkpointed unit.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use ewb_core::fakes::{chained_model, dated_case, MemoryOpener, ScriptedEvaluator};
use ewb_core::{
    CaseCollection, CheckpointKey, CheckpointStore, Driver, EvaluationSpec, EventType,
    MetricSample, ModelRegistry, ResolutionStrategy, SourceResolver, UnitState,
};

const MODELS: [&str; 3] = ["cira_fourv2_gfs", "cira_gc_gfs", "cira_pangu_gfs"];

fn catalog() -> CaseCollection {
    let start = NaiveDate::from_ymd_opt(2023, 7, 1).unwrap();
    (1..=5)
        .map(|i| dated_case(i, start, start + chrono::Days::new(6)))
        .collect()
}

fn library(value: f64) -> ScriptedEvaluator {
    MODELS.iter().fold(ScriptedEvaluator::new(), |lib, model| {
        lib.with_default(
            &format!("{model} primary"),
            vec![MetricSample::new("mean_absolute_error", Some(48), value)],
        )
    })
}

fn driver(dir: &Path, library: Arc<ScriptedEvaluator>, opener: Arc<MemoryOpener>) -> Driver {
    let entries = MODELS
        .iter()
        .map(|model| {
            chained_model(
                model,
                ResolutionStrategy::Fallback,
                &[format!("{model} primary").as_str()],
            )
        })
        .collect();
    let registry = Arc::new(ModelRegistry::new(entries).unwrap());
    Driver::new(
        Arc::new(SourceResolver::new(registry, opener)),
        library,
        CheckpointStore::new(dir),
        catalog(),
        vec![EvaluationSpec::new(
            EventType::HeatWave,
            &["mean_absolute_error"],
            "ERA5",
        )],
    )
}

fn all_models() -> Vec<String> {
    MODELS.iter().map(|m| m.to_string()).collect()
}

#[tokio::test]
async fn restart_skips_checkpointed_unit_and_finishes_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let first_key = CheckpointKey::new(MODELS[0], EventType::HeatWave);

    // First process: model 1 reaches CHECKPOINTED, then the process dies.
    let first = driver(
        dir.path(),
        Arc::new(library(1.0)),
        Arc::new(MemoryOpener::new()),
    );
    let report = first
        .run_batch(&all_models()[..1], EventType::HeatWave)
        .await
        .unwrap();
    assert_eq!(report.unit(MODELS[0]).unwrap().state, UnitState::Checkpointed);
    let saved = first.store().load(&first_key).unwrap().unwrap();
    let saved_bytes = std::fs::read(first.store().path(&first_key)).unwrap();

    // Second process: a different evaluator, so recomputation would show.
    let library = Arc::new(library(9.0));
    let opener = Arc::new(MemoryOpener::new());
    let second = driver(dir.path(), library.clone(), opener.clone());
    let report = second
        .run_batch(&all_models(), EventType::HeatWave)
        .await
        .unwrap();

    let resumed = report.unit(MODELS[0]).unwrap();
    assert!(resumed.resumed);
    assert_eq!(
        resumed.history,
        vec![UnitState::Pending, UnitState::Checkpointed]
    );
    assert!(library
        .calls_for(&format!("{} primary", MODELS[0]))
        .is_empty());
    assert_eq!(second.store().load(&first_key).unwrap().unwrap(), saved);
    assert_eq!(
        std::fs::read(second.store().path(&first_key)).unwrap(),
        saved_bytes
    );

    for model in &MODELS[1..] {
        let unit = report.unit(model).unwrap();
        assert!(!unit.resumed);
        assert_eq!(unit.state, UnitState::Checkpointed);
        assert_eq!(unit.counts.success, 5);
        assert_eq!(library.calls_for(&format!("{model} primary")).len(), 5);
    }
    assert!(report.all_checkpointed());
    // Only the two recomputed units opened a source.
    assert_eq!(opener.open_count(), 2);
    assert_eq!(second.store().list().unwrap().len(), 3);
}

#[tokio::test]
async fn no_resume_recomputes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let first = driver(
        dir.path(),
        Arc::new(library(1.0)),
        Arc::new(MemoryOpener::new()),
    );
    first
        .run_batch(&all_models(), EventType::HeatWave)
        .await
        .unwrap();

    let library = Arc::new(library(9.0));
    let second = driver(dir.path(), library.clone(), Arc::new(MemoryOpener::new()))
        .with_resume(false);
    let report = second
        .run_batch(&all_models(), EventType::HeatWave)
        .await
        .unwrap();

    assert!(report.units.iter().all(|u| !u.resumed));
    assert_eq!(library.call_count(), 15);
}

#[tokio::test]
async fn corrupt_checkpoint_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let key = CheckpointKey::new(MODELS[1], EventType::HeatWave);
    let store = CheckpointStore::new(dir.path());
    std::fs::write(store.path(&key), b"{\"schema_version\": 1, \"records\": [").unwrap();

    let library = Arc::new(library(3.0));
    let driver = driver(dir.path(), library.clone(), Arc::new(MemoryOpener::new()));
    let report = driver
        .run_batch(&[MODELS[1].to_string()], EventType::HeatWave)
        .await
        .unwrap();

    let unit = report.unit(MODELS[1]).unwrap();
    assert!(!unit.resumed);
    assert_eq!(unit.state, UnitState::Checkpointed);
    assert_eq!(library.calls_for(&format!("{} primary", MODELS[1])).len(), 5);
    assert!(store.load(&key).unwrap().is_some());
}
