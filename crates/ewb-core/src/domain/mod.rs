//! Domain model: cases, intervals, descriptors, evaluation specs and results.

pub mod case;
pub mod descriptor;
pub mod error;
pub mod evaluation;
pub mod interval;
pub mod result;

pub use case::{Case, CaseCollection, CaseId, CaseSelector, EventType, Partition, Region};
pub use descriptor::{
    CredentialsRef, DatasetDescriptor, SourceConfig, SourceKind, StorageLocation, StorageOptions,
};
pub use error::{
    AggregationError, CheckpointError, ConfigurationError, EvaluationError, EwbError, Result,
    SourceOpenError,
};
pub use evaluation::{default_evaluations, EvaluationSpec, TargetRef};
pub use interval::{contains, overlaps, DateInterval};
pub use result::{LeadTime, MetricSample, RecordValue, ResultKey, ResultRecord, ResultTable};
