//! Opened sources and the dataset-opener seam.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DatasetDescriptor, SourceOpenError};

/// A materialized, read-only dataset. Shared by every worker of a model run.
pub trait Source: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &DatasetDescriptor;

    /// Opaque session data produced by the opener (repository session,
    /// resolved snapshot id, ...). Passed through to the evaluation library.
    fn session(&self) -> Option<&serde_json::Value> {
        None
    }

    /// Forecast name used in result records.
    fn name(&self) -> &str {
        &self.descriptor().display_name
    }

    fn is_in_memory(&self) -> bool {
        self.descriptor().kind.is_in_memory()
    }
}

/// Opens descriptors. May be slow and may fail on auth or network errors.
#[async_trait]
pub trait DatasetOpener: Send + Sync {
    async fn open(&self, descriptor: &DatasetDescriptor) -> Result<Arc<dyn Source>, SourceOpenError>;
}

/// Generic source handle returned by the bundled openers.
#[derive(Debug, Clone)]
pub struct OpenedSource {
    descriptor: DatasetDescriptor,
    session: Option<serde_json::Value>,
    pub opened_at: DateTime<Utc>,
}

impl OpenedSource {
    pub fn new(descriptor: DatasetDescriptor, session: Option<serde_json::Value>) -> Self {
        Self {
            descriptor,
            session,
            opened_at: Utc::now(),
        }
    }
}

impl Source for OpenedSource {
    fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    fn session(&self) -> Option<&serde_json::Value> {
        self.session.as_ref()
    }
}

/// Build a [`SourceOpenError`] for `descriptor`.
pub fn open_error(descriptor: &DatasetDescriptor, reason: impl Into<String>) -> SourceOpenError {
    SourceOpenError {
        model: descriptor.model_name.clone(),
        kind: descriptor.kind.to_string(),
        location: descriptor.storage_location.to_string(),
        reason: reason.into(),
    }
}
