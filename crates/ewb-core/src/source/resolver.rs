//! Lazy resolution and once-per-process materialization of data sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument};

use crate::domain::{ConfigurationError, DatasetDescriptor, EventType, SourceKind, SourceOpenError};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::ModelRegistry;

use super::opener::{DatasetOpener, Source};

type OpenResult = Result<Arc<dyn Source>, SourceOpenError>;

/// Memoization key: one opened source per model and storage kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub model_name: String,
    pub kind: SourceKind,
}

impl SourceKey {
    pub fn of(descriptor: &DatasetDescriptor) -> Self {
        Self {
            model_name: descriptor.model_name.clone(),
            kind: descriptor.kind,
        }
    }
}

/// Turns `(model, event_type)` into descriptors and opens them on demand.
///
/// Each [`SourceKey`] is opened at most once, even under concurrent
/// `materialize` calls. Open failures are cached too: a source that failed
/// once is reported failed for the rest of the process instead of being
/// retried mid-run.
pub struct SourceResolver {
    registry: Arc<ModelRegistry>,
    opener: Arc<dyn DatasetOpener>,
    opened: Mutex<HashMap<SourceKey, Arc<OnceCell<OpenResult>>>>,
}

impl SourceResolver {
    pub fn new(registry: Arc<ModelRegistry>, opener: Arc<dyn DatasetOpener>) -> Self {
        Self {
            registry,
            opener,
            opened: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Ordered descriptor chain, primary first. Opens nothing.
    pub fn resolve(
        &self,
        model: &str,
        event_type: EventType,
    ) -> Result<Vec<DatasetDescriptor>, ConfigurationError> {
        self.registry.resolve(model, event_type)
    }

    /// Open `descriptor`, or return the handle (or error) from the first open
    /// of the same key.
    #[instrument(skip(self, descriptor), fields(model = %descriptor.model_name, kind = %descriptor.kind))]
    pub async fn materialize(&self, descriptor: &DatasetDescriptor) -> OpenResult {
        let cell = {
            let mut opened = self.opened.lock().await;
            opened.entry(SourceKey::of(descriptor)).or_default().clone()
        };

        cell.get_or_init(|| self.open(descriptor)).await.clone()
    }

    /// Number of keys that have been materialized (successfully or not).
    pub async fn materialized_count(&self) -> usize {
        let opened = self.opened.lock().await;
        opened.values().filter(|cell| cell.initialized()).count()
    }

    async fn open(&self, descriptor: &DatasetDescriptor) -> OpenResult {
        debug!(location = %descriptor.storage_location, "opening source");
        let started = Instant::now();
        match self.opener.open(descriptor).await {
            Ok(source) => {
                METRICS.inc_sources_opened();
                obs::emit_source_opened(
                    &descriptor.model_name,
                    descriptor.kind.as_str(),
                    &descriptor.storage_location.to_string(),
                    started.elapsed().as_millis() as u64,
                );
                Ok(source)
            }
            Err(e) => {
                obs::emit_source_open_failed(&e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryOpener;
    use crate::registry::ModelRegistry;

    fn resolver(opener: Arc<MemoryOpener>) -> SourceResolver {
        SourceResolver::new(Arc::new(ModelRegistry::builtin()), opener)
    }

    #[tokio::test]
    async fn test_resolve_does_not_open() {
        let opener = Arc::new(MemoryOpener::new());
        let resolver = resolver(opener.clone());
        let chain = resolver.resolve("hres", EventType::HeatWave).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(opener.open_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_materialize_opens_once() {
        let opener = Arc::new(MemoryOpener::new());
        let resolver = Arc::new(resolver(opener.clone()));
        let descriptor = resolver.resolve("bb_aifs", EventType::HeatWave).unwrap()[0].clone();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let resolver = resolver.clone();
            let descriptor = descriptor.clone();
            handles.push(tokio::spawn(async move {
                resolver.materialize(&descriptor).await.unwrap()
            }));
        }
        let mut sources = Vec::new();
        for handle in handles {
            sources.push(handle.await.unwrap());
        }

        assert_eq!(opener.open_count(), 1);
        assert!(sources.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(resolver.materialized_count().await, 1);
    }

    #[tokio::test]
    async fn test_same_kind_shared_across_event_types() {
        let opener = Arc::new(MemoryOpener::new());
        let resolver = resolver(opener.clone());
        let heat = resolver.resolve("cira_gc_ifs", EventType::HeatWave).unwrap();
        let freeze = resolver.resolve("cira_gc_ifs", EventType::Freeze).unwrap();

        resolver.materialize(&heat[0]).await.unwrap();
        resolver.materialize(&freeze[0]).await.unwrap();
        assert_eq!(opener.open_count(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_cached() {
        let opener = Arc::new(MemoryOpener::new());
        let resolver = resolver(opener.clone());
        let chain = resolver.resolve("hres", EventType::HeatWave).unwrap();
        opener.fail_for(&chain[1].storage_location);

        let first = resolver.materialize(&chain[1]).await.unwrap_err();
        let second = resolver.materialize(&chain[1]).await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.model, "hres");
        assert_eq!(opener.open_count(), 1);

        // The primary is a different key and still opens.
        resolver.materialize(&chain[0]).await.unwrap();
        assert_eq!(opener.open_count(), 2);
    }
}
