//! Primary/fallback merge and result table assembly.
//!
//! Outcomes are matched by slot, `(case_id, target_source)`. A primary
//! outcome is only replaced when it is `Empty` and the fallback set holds an
//! outcome for the same slot.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::domain::{AggregationError, CaseId, MetricSample, RecordValue, ResultTable};
use crate::worker::{CaseResult, Outcome, OutcomeStatus};

type Slot = (CaseId, String);

fn slot(outcome: &Outcome) -> Slot {
    (outcome.case_id, outcome.target_source.clone())
}

fn rank(status: OutcomeStatus) -> u8 {
    match status {
        OutcomeStatus::Success => 0,
        OutcomeStatus::Failed => 1,
        OutcomeStatus::Empty => 2,
    }
}

/// Success / Empty / Failed counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub empty: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn tally(outcomes: &[Outcome]) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            match outcome.status() {
                OutcomeStatus::Success => counts.success += 1,
                OutcomeStatus::Empty => counts.empty += 1,
                OutcomeStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.success + self.empty + self.failed
    }
}

impl std::ops::AddAssign for OutcomeCounts {
    fn add_assign(&mut self, other: Self) {
        self.success += other.success;
        self.empty += other.empty;
        self.failed += other.failed;
    }
}

/// Stateless merge operations.
pub struct ResultAggregator;

impl ResultAggregator {
    /// Case ids whose outcome is `Empty`: the only cases a fallback source
    /// is asked to evaluate.
    pub fn empty_cases(outcomes: &[Outcome]) -> BTreeSet<CaseId> {
        outcomes
            .iter()
            .filter(|o| o.is_empty())
            .map(|o| o.case_id)
            .collect()
    }

    /// Apply the fallback policy at the outcome level, one outcome per slot.
    ///
    /// Used to chain more than one fallback source before building a table.
    pub fn resolve(primary: &[Outcome], fallback: &[Outcome]) -> Vec<Outcome> {
        let mut best: BTreeMap<Slot, &Outcome> = BTreeMap::new();
        for outcome in fallback {
            best.entry(slot(outcome))
                .and_modify(|current| {
                    if rank(outcome.status()) < rank(current.status()) {
                        *current = outcome;
                    }
                })
                .or_insert(outcome);
        }

        let mut resolved: BTreeMap<Slot, Outcome> = BTreeMap::new();
        for outcome in primary {
            let key = slot(outcome);
            let chosen = match (outcome.status(), best.get(&key)) {
                (OutcomeStatus::Empty, Some(replacement)) => (*replacement).clone(),
                _ => outcome.clone(),
            };
            resolved
                .entry(key)
                .and_modify(|current| {
                    if rank(chosen.status()) < rank(current.status()) {
                        *current = chosen.clone();
                    }
                })
                .or_insert(chosen);
        }
        resolved.into_values().collect()
    }

    /// Merge primary and fallback outcomes into a result table.
    ///
    /// Idempotent: `merge(p, &Self::outcomes(&merge(p, f)?))` equals
    /// `merge(p, f)`.
    pub fn merge(primary: &[Outcome], fallback: &[Outcome]) -> Result<ResultTable, AggregationError> {
        Self::table(&Self::resolve(primary, fallback))
    }

    /// Result table holding the records of every outcome.
    pub fn table(outcomes: &[Outcome]) -> Result<ResultTable, AggregationError> {
        let mut table = ResultTable::new();
        for outcome in outcomes {
            for record in outcome.to_records() {
                table.insert(record)?;
            }
        }
        Ok(table)
    }

    /// Rebuild outcomes from a table, one per `(case, forecast, target)`.
    pub fn outcomes(table: &ResultTable) -> Vec<Outcome> {
        let mut grouped: BTreeMap<(CaseId, String, String), CaseResult> = BTreeMap::new();
        for (key, value) in table.iter() {
            let group = (
                key.case_id,
                key.forecast_source.clone(),
                key.target_source.clone(),
            );
            match value {
                RecordValue::Value { value } => {
                    let sample = MetricSample {
                        metric: key.metric.clone().unwrap_or_default(),
                        lead_time: key.lead_time,
                        value: *value,
                    };
                    if let CaseResult::Success { samples } = grouped
                        .entry(group)
                        .or_insert_with(|| CaseResult::Success { samples: Vec::new() })
                    {
                        samples.push(sample);
                    }
                }
                RecordValue::Empty => {
                    grouped.entry(group).or_insert(CaseResult::Empty);
                }
                RecordValue::Failed { error } => {
                    grouped.insert(
                        group,
                        CaseResult::Failed {
                            error: error.clone(),
                        },
                    );
                }
            }
        }
        grouped
            .into_iter()
            .map(|((case_id, forecast_source, target_source), result)| Outcome {
                case_id,
                forecast_source,
                target_source,
                result,
            })
            .collect()
    }

    /// Counts per slot of a finished table.
    pub fn counts(table: &ResultTable) -> OutcomeCounts {
        OutcomeCounts::tally(&Self::outcomes(table))
    }
}
