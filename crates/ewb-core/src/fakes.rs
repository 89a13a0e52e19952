//! In-memory collaborators (testing only)
//!
//! `MemoryOpener` and `ScriptedEvaluator` satisfy the opener and evaluation
//! library contracts without touching the network, and record every call so
//! tests can assert on dispatch counts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::{
    Case, CaseId, CredentialsRef, DatasetDescriptor, EvaluationError, EvaluationSpec, EventType,
    MetricSample, Region, SourceConfig, SourceKind, SourceOpenError, StorageLocation,
    StorageOptions,
};
use crate::registry::{ModelEntry, ResolutionStrategy};
use crate::source::{open_error, DatasetOpener, OpenedSource, Source};
use crate::worker::EvaluationLibrary;

// ---------------------------------------------------------------------------
// MemoryOpener
// ---------------------------------------------------------------------------

/// Opens any descriptor instantly (or after `delay`), unless its location
/// was marked failing.
#[derive(Debug, Default)]
pub struct MemoryOpener {
    opens: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every open of `location` fail.
    pub fn fail_for(&self, location: &StorageLocation) {
        self.failing.lock().unwrap().insert(location.to_string());
    }

    /// Number of `open` calls, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetOpener for MemoryOpener {
    async fn open(&self, descriptor: &DatasetDescriptor) -> Result<Arc<dyn Source>, SourceOpenError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let location = descriptor.storage_location.to_string();
        if self.failing.lock().unwrap().contains(&location) {
            return Err(open_error(descriptor, "access denied"));
        }
        Ok(Arc::new(OpenedSource::new(
            descriptor.clone(),
            Some(serde_json::json!({ "opened_by": "memory" })),
        )))
    }
}

// ---------------------------------------------------------------------------
// ScriptedEvaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Script {
    Samples(Vec<MetricSample>),
    Error(EvaluationError),
    Panic,
}

/// Evaluation library with canned per-(source, case) responses.
///
/// Unscripted calls fall back to the source default, then to an empty
/// result.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    scripts: HashMap<(String, CaseId), Script>,
    defaults: HashMap<String, Vec<MetricSample>>,
    calls: Mutex<Vec<(String, CaseId)>>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_samples(mut self, source: &str, case_id: CaseId, samples: Vec<MetricSample>) -> Self {
        self.scripts
            .insert((source.to_string(), case_id), Script::Samples(samples));
        self
    }

    /// Every case on `source` without its own script returns `samples`.
    pub fn with_default(mut self, source: &str, samples: Vec<MetricSample>) -> Self {
        self.defaults.insert(source.to_string(), samples);
        self
    }

    pub fn with_empty(mut self, source: &str, case_id: CaseId) -> Self {
        self.scripts
            .insert((source.to_string(), case_id), Script::Samples(Vec::new()));
        self
    }

    pub fn with_error(mut self, source: &str, case_id: CaseId, error: EvaluationError) -> Self {
        self.scripts
            .insert((source.to_string(), case_id), Script::Error(error));
        self
    }

    pub fn with_panic(mut self, source: &str, case_id: CaseId) -> Self {
        self.scripts
            .insert((source.to_string(), case_id), Script::Panic);
        self
    }

    /// Total number of `run_pipeline` calls.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Cases evaluated against `source`, in call order.
    pub fn calls_for(&self, source: &str) -> Vec<CaseId> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == source)
            .map(|(_, id)| *id)
            .collect()
    }
}

#[async_trait]
impl EvaluationLibrary for ScriptedEvaluator {
    async fn run_pipeline(
        &self,
        case: &Case,
        _spec: &EvaluationSpec,
        source: &dyn Source,
    ) -> Result<Vec<MetricSample>, EvaluationError> {
        let key = (source.name().to_string(), case.case_id);
        self.calls.lock().unwrap().push(key.clone());
        tokio::task::yield_now().await;

        match self.scripts.get(&key) {
            Some(Script::Samples(samples)) => Ok(samples.clone()),
            Some(Script::Error(e)) => Err(e.clone()),
            Some(Script::Panic) => panic!("scripted panic for case {}", case.case_id),
            None => Ok(self.defaults.get(&key.0).cloned().unwrap_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A heat wave case starting on 2022-06-01 plus `id` days, lasting a week.
pub fn sample_case(id: u32) -> Case {
    let start = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap() + chrono::Days::new(id as u64);
    dated_case(id, start, start + chrono::Days::new(7))
}

pub fn dated_case(id: u32, start: NaiveDate, end: NaiveDate) -> Case {
    Case {
        case_id: CaseId(id),
        title: format!("case {id}"),
        event_type: EventType::HeatWave,
        start_date: start,
        end_date: end,
        location: Region::BoundingBox {
            latitude_min: 30.0,
            latitude_max: 40.0,
            longitude_min: -100.0,
            longitude_max: -90.0,
        },
    }
}

/// An opened in-memory source named `display_name`.
pub fn memory_source(model: &str, display_name: &str) -> Arc<dyn Source> {
    let config = source_config(SourceKind::Memory, &format!("memory://{display_name}"), display_name);
    let descriptor = DatasetDescriptor::from_config(model, EventType::HeatWave, &config);
    Arc::new(OpenedSource::new(descriptor, None))
}

/// Anonymous source config with no coverage limit.
pub fn source_config(kind: SourceKind, location: &str, display_name: &str) -> SourceConfig {
    SourceConfig {
        kind,
        location: location
            .parse()
            .unwrap_or_else(|e| panic!("bad test location {location}: {e}")),
        display_name: display_name.to_string(),
        credentials: CredentialsRef::Anonymous,
        storage_options: StorageOptions::default(),
        variable_mapping: BTreeMap::new(),
        coverage: None,
    }
}

/// Heat-wave model whose sources are named by `displays`, primary first.
/// Kinds are assigned in order Zarr, Arraylake, Kerchunk.
pub fn chained_model(name: &str, strategy: ResolutionStrategy, displays: &[&str]) -> ModelEntry {
    let kinds = [SourceKind::Zarr, SourceKind::Arraylake, SourceKind::Kerchunk];
    let sources = displays
        .iter()
        .zip(kinds)
        .map(|(display, kind)| {
            let location = match kind {
                SourceKind::Arraylake => format!("arraylake://test/{name}/{display}"),
                _ => format!("gs://test-bucket/{name}/{display}.{}", kind.as_str()),
            };
            source_config(kind, &location, display)
        })
        .collect();
    ModelEntry {
        name: name.to_string(),
        event_types: [EventType::HeatWave].into(),
        strategy,
        sources,
    }
}
