//! Bounded fan-out of case workers over one source.
//!
//! Every case becomes its own tokio task behind a semaphore. A failing or
//! panicking case is turned into a `Failed` outcome at this boundary, so
//! siblings always run to completion and every input case gets exactly one
//! outcome.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::domain::{CaseCollection, CaseId, EvaluationSpec};
use crate::metrics::METRICS;
use crate::source::Source;
use crate::worker::{CaseWorker, Outcome};

/// Worker pool flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Full pool; each worker reads the shared remote source independently.
    #[default]
    Loky,
    /// Capped pool for sources that live in process memory.
    Threading,
}

/// Pool sizing, read from `[parallel]` in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelConfig {
    pub backend: Backend,
    pub n_jobs: usize,
    /// Upper bound for in-memory sources, whatever the backend.
    pub in_memory_max_jobs: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Loky,
            n_jobs: 32,
            in_memory_max_jobs: 4,
        }
    }
}

impl ParallelConfig {
    /// Backend used for `source`. In-memory sources always run threaded.
    pub fn backend_for(&self, source: &dyn Source) -> Backend {
        if source.is_in_memory() {
            Backend::Threading
        } else {
            self.backend
        }
    }

    /// Number of cases allowed in flight against `source`. Never zero.
    pub fn concurrency_for(&self, source: &dyn Source) -> usize {
        let n = match self.backend_for(source) {
            Backend::Loky => self.n_jobs,
            Backend::Threading => self.n_jobs.min(self.in_memory_max_jobs),
        };
        n.max(1)
    }
}

/// Dispatches cases to [`CaseWorker`]s.
#[derive(Clone)]
pub struct ParallelScheduler {
    worker: CaseWorker,
}

impl ParallelScheduler {
    pub fn new(worker: CaseWorker) -> Self {
        Self { worker }
    }

    /// Evaluate every case in `cases` against `source`, at most `concurrency`
    /// at a time. The returned case ids equal the input case ids; order is
    /// unspecified.
    #[instrument(skip_all, fields(source = %source.name(), cases = cases.len(), concurrency = concurrency))]
    pub async fn run_all(
        &self,
        cases: &CaseCollection,
        spec: &EvaluationSpec,
        source: Arc<dyn Source>,
        concurrency: usize,
    ) -> Vec<Outcome> {
        METRICS.add_cases_dispatched(cases.len() as u64);
        let sem = Arc::new(Semaphore::new(concurrency.max(1)));
        let spec = Arc::new(spec.clone());

        let mut tasks: Vec<(CaseId, JoinHandle<Outcome>)> = Vec::with_capacity(cases.len());
        for case in cases.cases() {
            let case = case.clone();
            let case_id = case.case_id;
            let worker = self.worker.clone();
            let spec = Arc::clone(&spec);
            let source = Arc::clone(&source);
            let sem = Arc::clone(&sem);

            let task = tokio::spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return Outcome::failed(case.case_id, source.name(), spec.target_name(), e)
                    }
                };
                worker.run(&case, &spec, source.as_ref()).await
            });
            tasks.push((case_id, task));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (case_id, task) in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(case_id = %case_id, error = %e, "case worker aborted");
                    outcomes.push(Outcome::failed(
                        case_id,
                        source.name(),
                        spec.target_name(),
                        format!("worker aborted: {e}"),
                    ));
                }
            }
        }
        debug!(outcomes = outcomes.len(), "all cases settled");
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::domain::{Case, EvaluationError, EventType, MetricSample};
    use crate::fakes::{memory_source, sample_case, ScriptedEvaluator};
    use crate::worker::{EvaluationLibrary, OutcomeStatus};

    fn spec() -> EvaluationSpec {
        EvaluationSpec::new(EventType::HeatWave, &["rmse"], "ERA5")
    }

    fn cases(n: u32) -> CaseCollection {
        (1..=n).map(sample_case).collect()
    }

    fn scheduler(library: impl EvaluationLibrary + 'static) -> ParallelScheduler {
        ParallelScheduler::new(CaseWorker::new(Arc::new(library)))
    }

    fn ids(outcomes: &[Outcome]) -> BTreeSet<CaseId> {
        outcomes.iter().map(|o| o.case_id).collect()
    }

    #[tokio::test]
    async fn test_case_ids_preserved_for_any_size() {
        let source = memory_source("m", "primary");
        let library = ScriptedEvaluator::new()
            .with_default("primary", vec![MetricSample::new("rmse", Some(24), 1.0)]);
        let scheduler = scheduler(library);

        for n in [0, 1, 2, 17, 64] {
            let input = cases(n);
            let outcomes = scheduler
                .run_all(&input, &spec(), source.clone(), 4)
                .await;
            assert_eq!(outcomes.len(), input.len());
            assert_eq!(ids(&outcomes), input.ids());
        }
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_affect_siblings() {
        let source = memory_source("m", "primary");
        let library = ScriptedEvaluator::new()
            .with_default("primary", vec![MetricSample::new("rmse", None, 2.0)])
            .with_error("primary", CaseId(2), EvaluationError::Timeout(30))
            .with_panic("primary", CaseId(4));
        let scheduler = scheduler(library);

        let outcomes = scheduler.run_all(&cases(6), &spec(), source, 2).await;
        assert_eq!(ids(&outcomes), cases(6).ids());
        for outcome in &outcomes {
            let expected = match outcome.case_id {
                CaseId(2) | CaseId(4) => OutcomeStatus::Failed,
                _ => OutcomeStatus::Success,
            };
            assert_eq!(outcome.status(), expected, "case {}", outcome.case_id);
        }
    }

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EvaluationLibrary for Gauge {
        async fn run_pipeline(
            &self,
            _case: &Case,
            _spec: &EvaluationSpec,
            _source: &dyn Source,
        ) -> Result<Vec<MetricSample>, EvaluationError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![MetricSample::new("rmse", None, 0.0)])
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scheduler = ParallelScheduler::new(CaseWorker::new(gauge.clone()));

        let outcomes = scheduler
            .run_all(&cases(20), &spec(), memory_source("m", "primary"), 3)
            .await;
        assert_eq!(outcomes.len(), 20);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_in_memory_source_is_capped() {
        let config = ParallelConfig {
            backend: Backend::Loky,
            n_jobs: 32,
            in_memory_max_jobs: 4,
        };
        let source = memory_source("m", "primary");
        assert_eq!(config.backend_for(source.as_ref()), Backend::Threading);
        assert_eq!(config.concurrency_for(source.as_ref()), 4);

        let zero = ParallelConfig {
            n_jobs: 0,
            ..config
        };
        assert_eq!(zero.concurrency_for(source.as_ref()), 1);
    }

    #[test]
    fn test_parallel_config_defaults_from_toml() {
        let config: ParallelConfig = toml::from_str("backend = \"threading\"").unwrap();
        assert_eq!(config.backend, Backend::Threading);
        assert_eq!(config.n_jobs, 32);
    }
}
