//! What to compute for a case, independent of the forecast source.

use serde::{Deserialize, Serialize};

use super::case::EventType;
use super::descriptor::StorageLocation;

/// Observational / reference dataset a forecast is scored against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetRef {
    /// Name reported in result records, e.g. `ERA5`, `GHCN`, `IBTrACS`.
    pub name: String,
    #[serde(default)]
    pub location: Option<StorageLocation>,
}

/// Metrics plus the target they are computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationSpec {
    pub event_type: EventType,
    pub metrics: Vec<String>,
    pub target: TargetRef,
}

impl EvaluationSpec {
    pub fn new(event_type: EventType, metrics: &[&str], target: &str) -> Self {
        Self {
            event_type,
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
            target: TargetRef {
                name: target.to_string(),
                location: None,
            },
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target.name
    }
}

/// Evaluations run by default for each event type.
pub fn default_evaluations() -> Vec<EvaluationSpec> {
    let heat_freeze = [
        "maximum_mean_absolute_error",
        "root_mean_squared_error",
        "maximum_lowest_mean_absolute_error",
    ];
    vec![
        EvaluationSpec::new(EventType::HeatWave, &heat_freeze, "GHCN"),
        EvaluationSpec::new(EventType::HeatWave, &heat_freeze, "ERA5"),
        EvaluationSpec::new(EventType::Freeze, &heat_freeze, "GHCN"),
        EvaluationSpec::new(EventType::Freeze, &heat_freeze, "ERA5"),
        EvaluationSpec::new(
            EventType::SevereConvection,
            &["critical_success_index", "false_alarm_ratio", "early_signal"],
            "LSR",
        ),
        EvaluationSpec::new(
            EventType::SevereConvection,
            &["critical_success_index", "false_alarm_ratio", "early_signal"],
            "PPH",
        ),
        EvaluationSpec::new(
            EventType::AtmosphericRiver,
            &["critical_success_index", "spatial_displacement", "early_signal"],
            "ERA5",
        ),
        EvaluationSpec::new(
            EventType::TropicalCyclone,
            &[
                "landfall_intensity_mean_absolute_error",
                "landfall_time_mean_error",
                "landfall_displacement",
            ],
            "IBTrACS",
        ),
    ]
}
