//! EWB Core Library
//!
//! Case-parallel evaluation of weather forecast models against reference
//! datasets, with source fallback and per-unit checkpointing.

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod external;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod telemetry;
pub mod worker;

pub use domain::{
    contains, default_evaluations, overlaps, AggregationError, Case, CaseCollection, CaseId,
    CaseSelector, CheckpointError, ConfigurationError, CredentialsRef, DatasetDescriptor,
    DateInterval, EvaluationError, EvaluationSpec, EventType, EwbError, LeadTime, MetricSample,
    Partition, RecordValue, Region, Result, ResultKey, ResultRecord, ResultTable, SourceConfig,
    SourceKind, SourceOpenError, StorageLocation, StorageOptions, TargetRef,
};

pub use aggregator::{OutcomeCounts, ResultAggregator};
pub use checkpoint::{CheckpointFile, CheckpointKey, CheckpointStore};
pub use config::Config;
pub use external::{CommandConfig, CommandEvaluator, CommandOpener};
pub use pipeline::{BatchReport, Driver, UnitReport, UnitState};
pub use registry::{ModelEntry, ModelRegistry, ResolutionStrategy};
pub use scheduler::{Backend, ParallelConfig, ParallelScheduler};
pub use source::{DatasetOpener, OpenedSource, Source, SourceKey, SourceResolver};
pub use worker::{CaseResult, CaseWorker, EvaluationLibrary, Outcome, OutcomeStatus};

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// EWB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
