//! Error taxonomy for the evaluation pipeline.
//!
//! Only [`ConfigurationError`] is meant to reach process exit. Every other
//! error is captured by the pipeline and turned into an [`Outcome`] or a unit
//! state.
//!
//! [`Outcome`]: crate::worker::Outcome

use std::path::PathBuf;

use crate::domain::case::CaseId;

/// Problems with static configuration. Fatal for the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model {model} does not support event type {event_type}")]
    UnsupportedEventType { model: String, event_type: String },

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("missing credentials for {model}: environment variable {var} is not set")]
    MissingCredentials { model: String, var: String },

    #[error("invalid storage location {location}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("invalid date interval: start {start} is after end {end}")]
    InvalidInterval { start: String, end: String },

    #[error("model {model} is misconfigured: {reason}")]
    InvalidModel { model: String, reason: String },

    #[error("no evaluations configured for event type {0}")]
    NoEvaluations(String),

    #[error("evaluation against {target} is configured twice for {event_type}")]
    DuplicateEvaluation { event_type: String, target: String },

    #[error("no evaluator configured: set [evaluator] program in the config file")]
    MissingEvaluator,

    #[error("failed to read config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to load case catalog {path}: {reason}")]
    Catalog { path: PathBuf, reason: String },
}

/// Opening a dataset failed. Fatal only for the model run that needed it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to open source {model}/{kind} at {location}: {reason}")]
pub struct SourceOpenError {
    pub model: String,
    pub kind: String,
    pub location: String,
    pub reason: String,
}

/// Raised by the evaluation library for a single case.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("evaluation library error: {0}")]
    Library(String),

    #[error("evaluation timed out after {0} seconds")]
    Timeout(u64),

    #[error("malformed evaluation output: {0}")]
    MalformedOutput(String),

    #[error("worker task aborted: {0}")]
    Aborted(String),
}

/// Errors from merging result tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    #[error(
        "duplicate result for case {case_id}, target {target_source}, metric {metric}, lead time {lead_time}"
    )]
    DuplicateKey {
        case_id: CaseId,
        target_source: String,
        metric: String,
        lead_time: String,
    },
}

/// Errors from the checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum EwbError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    SourceOpen(#[from] SourceOpenError),

    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl EwbError {
    /// Whether this error must abort the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, EwbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_names_variable() {
        let err = ConfigurationError::MissingCredentials {
            model: "bb_aifs".to_string(),
            var: "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bb_aifs"));
        assert!(msg.contains("GOOGLE_APPLICATION_CREDENTIALS"));
    }

    #[test]
    fn test_source_open_error_display() {
        let err = SourceOpenError {
            model: "hres".to_string(),
            kind: "zarr".to_string(),
            location: "gs://weatherbench2/hres.zarr".to_string(),
            reason: "403 forbidden".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("hres/zarr"));
        assert!(msg.contains("403"));
    }

    #[test]
    fn test_only_configuration_errors_are_fatal() {
        let fatal = EwbError::from(ConfigurationError::UnknownModel("nope".to_string()));
        assert!(fatal.is_fatal());

        let not_fatal = EwbError::from(AggregationError::DuplicateKey {
            case_id: CaseId(4),
            target_source: "ERA5".to_string(),
            metric: "rmse".to_string(),
            lead_time: "24h".to_string(),
        });
        assert!(!not_fatal.is_fatal());
    }
}
