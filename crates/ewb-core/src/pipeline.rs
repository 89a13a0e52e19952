//! Generic driver: one unit of work per `(model, event_type)`.
//!
//! A unit resolves its source chain, evaluates every case of the event type
//! and checkpoints the merged table. Units run one after another and never
//! affect each other; only configuration problems abort the batch.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{OutcomeCounts, ResultAggregator};
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::domain::{
    Case, CaseCollection, CaseSelector, ConfigurationError, DatasetDescriptor, EvaluationSpec,
    EventType, EwbError, ResultTable, SourceOpenError,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::ResolutionStrategy;
use crate::scheduler::{ParallelConfig, ParallelScheduler};
use crate::source::SourceResolver;
use crate::worker::{CaseResult, CaseWorker, EvaluationLibrary, Outcome};

/// Lifecycle of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Pending,
    Running,
    /// Some cases came back empty and a fallback source remains.
    PartialEmpty,
    FallbackRunning,
    Success,
    Checkpointed,
    Failed,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Checkpointed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Checkpointed)
                | (Running, Success)
                | (Running, PartialEmpty)
                | (Running, FallbackRunning)
                | (Running, Failed)
                | (PartialEmpty, FallbackRunning)
                | (FallbackRunning, PartialEmpty)
                | (FallbackRunning, FallbackRunning)
                | (FallbackRunning, Success)
                | (FallbackRunning, Failed)
                | (Success, Checkpointed)
                | (Success, Failed)
        )
    }
}

/// State of a unit plus every state it went through.
#[derive(Debug, Clone)]
struct UnitTracker {
    history: Vec<UnitState>,
}

impl UnitTracker {
    fn new() -> Self {
        Self {
            history: vec![UnitState::Pending],
        }
    }

    fn state(&self) -> UnitState {
        self.history.last().copied().unwrap_or(UnitState::Pending)
    }

    fn advance(&mut self, next: UnitState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(from = ?current, to = ?next, "unexpected unit transition");
        }
        self.history.push(next);
    }
}

/// Final report for one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub model: String,
    pub event_type: EventType,
    pub state: UnitState,
    pub history: Vec<UnitState>,
    pub counts: OutcomeCounts,
    pub records: usize,
    pub resumed: bool,
    pub checkpoint: Option<PathBuf>,
    pub error: Option<String>,
}

/// Report for a whole `run_batch` call.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub event_type: EventType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    pub fn unit(&self, model: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.model == model)
    }

    pub fn failed(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.state == UnitState::Failed)
    }

    pub fn all_checkpointed(&self) -> bool {
        self.units.iter().all(|u| u.state == UnitState::Checkpointed)
    }
}

/// Evaluated table of a unit before it is checkpointed.
struct UnitResult {
    table: ResultTable,
    counts: OutcomeCounts,
}

/// Runs batches of units.
pub struct Driver {
    resolver: Arc<SourceResolver>,
    scheduler: ParallelScheduler,
    parallel: ParallelConfig,
    store: CheckpointStore,
    catalog: CaseCollection,
    evaluations: Vec<EvaluationSpec>,
    resume: bool,
}

impl Driver {
    pub fn new(
        resolver: Arc<SourceResolver>,
        library: Arc<dyn EvaluationLibrary>,
        store: CheckpointStore,
        catalog: CaseCollection,
        evaluations: Vec<EvaluationSpec>,
    ) -> Self {
        Self {
            resolver,
            scheduler: ParallelScheduler::new(CaseWorker::new(library)),
            parallel: ParallelConfig::default(),
            store,
            catalog,
            evaluations,
            resume: true,
        }
    }

    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Skip units whose checkpoint already exists. On by default.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run one unit per model for `event_type`.
    ///
    /// Every model is resolved before any work starts, so a bad model name
    /// fails the batch without side effects.
    pub async fn run_batch(
        &self,
        models: &[String],
        event_type: EventType,
    ) -> Result<BatchReport, ConfigurationError> {
        let specs: Vec<EvaluationSpec> = self
            .evaluations
            .iter()
            .filter(|spec| spec.event_type == event_type)
            .cloned()
            .collect();
        if specs.is_empty() {
            return Err(ConfigurationError::NoEvaluations(event_type.to_string()));
        }
        let chains = models
            .iter()
            .map(|model| -> Result<_, ConfigurationError> {
                Ok((model.as_str(), self.resolver.resolve(model, event_type)?))
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%batch_id, %event_type, models = models.len(), "batch started");

        let mut units = Vec::with_capacity(chains.len());
        for (model, descriptors) in chains {
            let span = obs::unit_span(model, event_type.as_str());
            units.push(
                self.run_unit(model, event_type, &descriptors, &specs)
                    .instrument(span)
                    .await,
            );
        }

        METRICS.flush();
        Ok(BatchReport {
            batch_id,
            event_type,
            started_at,
            finished_at: Utc::now(),
            units,
        })
    }

    async fn run_unit(
        &self,
        model: &str,
        event_type: EventType,
        descriptors: &[DatasetDescriptor],
        specs: &[EvaluationSpec],
    ) -> UnitReport {
        let key = CheckpointKey::new(model, event_type);
        let mut tracker = UnitTracker::new();
        let mut report = UnitReport {
            model: model.to_string(),
            event_type,
            state: UnitState::Pending,
            history: Vec::new(),
            counts: OutcomeCounts::default(),
            records: 0,
            resumed: false,
            checkpoint: None,
            error: None,
        };

        if self.resume {
            match self.store.load(&key) {
                Ok(Some(table)) => {
                    obs::emit_unit_resumed(model, event_type.as_str(), table.len());
                    tracker.advance(UnitState::Checkpointed);
                    report.counts = ResultAggregator::counts(&table);
                    report.records = table.len();
                    report.resumed = true;
                    report.checkpoint = Some(self.store.path(&key));
                    return finish(report, tracker);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "ignoring unreadable checkpoint, recomputing"),
            }
        }

        let cases = self.unit_cases(event_type, descriptors);
        tracker.advance(UnitState::Running);
        obs::emit_unit_started(model, event_type.as_str(), cases.len());

        let strategy = match self.resolver.registry().get(model) {
            Ok(entry) => entry.strategy,
            Err(e) => return fail(report, tracker, &e),
        };
        let result = match strategy {
            ResolutionStrategy::Fallback => {
                self.run_fallback(&mut tracker, model, descriptors, &cases, specs)
                    .await
            }
            ResolutionStrategy::Partitioned { cutoff } => {
                let partition = cases.partition(cutoff);
                if !partition.straddling.is_empty() {
                    warn!(
                        %cutoff,
                        cases = ?partition.straddling.ids(),
                        "cases straddle the partition cutoff and are not evaluated"
                    );
                }
                self.run_partitioned(descriptors, [&partition.early, &partition.late], specs)
                    .await
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => return fail(report, tracker, &e),
        };
        tracker.advance(UnitState::Success);
        report.counts = result.counts;
        report.records = result.table.len();
        obs::emit_unit_summary(
            model,
            event_type.as_str(),
            result.counts.success,
            result.counts.empty,
            result.counts.failed,
        );

        match self.store.save(&key, &result.table) {
            Ok(path) => {
                METRICS.inc_checkpoints_written();
                obs::emit_unit_checkpointed(model, event_type.as_str(), &path, result.table.len());
                tracker.advance(UnitState::Checkpointed);
                report.checkpoint = Some(path);
                finish(report, tracker)
            }
            Err(e) => fail(report, tracker, &EwbError::from(e)),
        }
    }

    /// Cases of `event_type` that at least one source can serve.
    fn unit_cases(&self, event_type: EventType, descriptors: &[DatasetDescriptor]) -> CaseCollection {
        let all = self.catalog.select(&CaseSelector::EventType(event_type));
        let served: CaseCollection = all
            .cases()
            .iter()
            .filter(|case| descriptors.iter().any(|d| covers(d, case)))
            .cloned()
            .collect();
        if served.len() < all.len() {
            info!(
                skipped = all.len() - served.len(),
                "cases outside every source's coverage window"
            );
        }
        served
    }

    /// Primary first; each later source only sees slots still empty.
    async fn run_fallback(
        &self,
        tracker: &mut UnitTracker,
        model: &str,
        descriptors: &[DatasetDescriptor],
        cases: &CaseCollection,
        specs: &[EvaluationSpec],
    ) -> Result<UnitResult, EwbError> {
        let mut resolved: Vec<Option<Vec<Outcome>>> = vec![None; specs.len()];
        let mut first_error: Option<SourceOpenError> = None;
        let mut pending_error: Option<SourceOpenError> = None;
        let mut opened_any = false;

        for (i, descriptor) in descriptors.iter().enumerate() {
            let todo: Vec<CaseCollection> = resolved
                .iter()
                .map(|outcomes| match outcomes {
                    None => cases.clone(),
                    Some(outcomes) => cases.select(&CaseSelector::CaseIds(
                        ResultAggregator::empty_cases(outcomes),
                    )),
                })
                .collect();
            let waiting: usize = todo.iter().map(CaseCollection::len).sum();
            if waiting == 0 {
                break;
            }
            if i > 0 {
                if pending_error.is_none() {
                    tracker.advance(UnitState::PartialEmpty);
                }
                tracker.advance(UnitState::FallbackRunning);
                obs::emit_fallback(model, &descriptor.display_name, waiting);
            }

            let source = match self.resolver.materialize(descriptor).await {
                Ok(source) => source,
                Err(e) => {
                    warn!(error = %e, remaining = descriptors.len() - i - 1, "source unavailable, advancing");
                    first_error.get_or_insert_with(|| e.clone());
                    pending_error = Some(e);
                    continue;
                }
            };
            opened_any = true;
            pending_error = None;
            let concurrency = self.parallel.concurrency_for(source.as_ref());

            for ((spec, todo), slot) in specs.iter().zip(&todo).zip(resolved.iter_mut()) {
                let (covered, uncovered) = split_coverage(descriptor, todo);
                if i > 0 {
                    METRICS.add_fallback_dispatches(covered.len() as u64);
                }
                let mut outcomes = self
                    .scheduler
                    .run_all(&covered, spec, source.clone(), concurrency)
                    .await;
                outcomes.extend(
                    uncovered
                        .cases()
                        .iter()
                        .map(|case| Outcome::empty(case.case_id, source.name(), spec.target_name())),
                );
                *slot = Some(match slot.take() {
                    None => outcomes,
                    Some(previous) => ResultAggregator::resolve(&previous, &outcomes),
                });
            }
        }

        if !opened_any {
            if let Some(e) = first_error {
                return Err(e.into());
            }
        }

        let mut table = ResultTable::new();
        let mut counts = OutcomeCounts::default();
        for outcomes in resolved {
            let mut outcomes = outcomes.unwrap_or_default();
            if let Some(e) = &pending_error {
                // The source meant to fill these slots could not be opened.
                for outcome in outcomes.iter_mut().filter(|o| o.is_empty()) {
                    outcome.result = CaseResult::Failed {
                        error: e.to_string(),
                    };
                }
            }
            counts += OutcomeCounts::tally(&outcomes);
            table = ResultTable::union_partitions(table, ResultAggregator::table(&outcomes)?)?;
        }
        Ok(UnitResult { table, counts })
    }

    /// Source 0 serves the early cases, source 1 the late ones.
    async fn run_partitioned(
        &self,
        descriptors: &[DatasetDescriptor],
        sides: [&CaseCollection; 2],
        specs: &[EvaluationSpec],
    ) -> Result<UnitResult, EwbError> {
        let mut table = ResultTable::new();
        let mut counts = OutcomeCounts::default();
        let mut errors = Vec::new();

        for (descriptor, cases) in descriptors.iter().zip(sides) {
            if cases.is_empty() {
                continue;
            }
            let source = match self.resolver.materialize(descriptor).await {
                Ok(source) => Some(source),
                Err(e) => {
                    warn!(error = %e, cases = cases.len(), "partition source unavailable");
                    errors.push(e);
                    None
                }
            };

            for spec in specs {
                let outcomes = match &source {
                    Some(source) => {
                        let (covered, uncovered) = split_coverage(descriptor, cases);
                        let mut outcomes = self
                            .scheduler
                            .run_all(
                                &covered,
                                spec,
                                source.clone(),
                                self.parallel.concurrency_for(source.as_ref()),
                            )
                            .await;
                        outcomes.extend(uncovered.cases().iter().map(|case| {
                            Outcome::empty(case.case_id, source.name(), spec.target_name())
                        }));
                        outcomes
                    }
                    None => cases
                        .cases()
                        .iter()
                        .map(|case| {
                            Outcome::failed(
                                case.case_id,
                                &descriptor.display_name,
                                spec.target_name(),
                                errors.last().map(ToString::to_string).unwrap_or_default(),
                            )
                        })
                        .collect(),
                };
                counts += OutcomeCounts::tally(&outcomes);
                table = ResultTable::union_partitions(table, ResultAggregator::table(&outcomes)?)?;
            }
        }

        let attempted = descriptors
            .iter()
            .zip(sides)
            .filter(|(_, cases)| !cases.is_empty())
            .count();
        if attempted > 0 && errors.len() == attempted {
            return Err(errors.remove(0).into());
        }
        Ok(UnitResult { table, counts })
    }
}

fn covers(descriptor: &DatasetDescriptor, case: &Case) -> bool {
    match (&descriptor.coverage, case.interval()) {
        (None, _) => true,
        (Some(window), Ok(interval)) => window.contains(&interval),
        (Some(_), Err(_)) => false,
    }
}

fn split_coverage(descriptor: &DatasetDescriptor, cases: &CaseCollection) -> (CaseCollection, CaseCollection) {
    let (covered, uncovered): (Vec<Case>, Vec<Case>) = cases
        .cases()
        .iter()
        .cloned()
        .partition(|case| covers(descriptor, case));
    (CaseCollection::new(covered), CaseCollection::new(uncovered))
}

fn finish(mut report: UnitReport, tracker: UnitTracker) -> UnitReport {
    report.state = tracker.state();
    report.history = tracker.history;
    report
}

fn fail(mut report: UnitReport, mut tracker: UnitTracker, error: &dyn std::fmt::Display) -> UnitReport {
    obs::emit_unit_failed(&report.model, report.event_type.as_str(), error);
    tracker.advance(UnitState::Failed);
    report.error = Some(error.to_string());
    finish(report, tracker)
}
