//! Data-driven model registry: `model_name -> ordered data sources`.
//!
//! One generic driver consumes this table instead of a bespoke script per
//! model. Entries are pure data; nothing is opened here.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{
    ConfigurationError, CredentialsRef, DatasetDescriptor, DateInterval, EventType, SourceConfig,
    SourceKind, StorageOptions,
};

/// How the sources of a model divide the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Primary first; later sources only see cases still empty.
    #[default]
    Fallback,
    /// Source 0 serves cases ending on or before `cutoff`, source 1 cases
    /// starting after it.
    Partitioned { cutoff: NaiveDate },
}

/// One model in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEntry {
    /// CLI name; `--run_<name>` selects the model.
    pub name: String,
    pub event_types: BTreeSet<EventType>,
    #[serde(default)]
    pub strategy: ResolutionStrategy,
    pub sources: Vec<SourceConfig>,
}

impl ModelEntry {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidModel {
            model: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(invalid("name must be non-empty lowercase [a-z0-9_]"));
        }
        if self.sources.is_empty() {
            return Err(invalid("at least one source is required"));
        }
        if self.event_types.is_empty() {
            return Err(invalid("at least one event type is required"));
        }
        // Opened sources are shared per (model, kind).
        let kinds: BTreeSet<SourceKind> = self.sources.iter().map(|s| s.kind).collect();
        if kinds.len() != self.sources.len() {
            return Err(invalid("each source of a model must have a distinct kind"));
        }
        if let ResolutionStrategy::Partitioned { .. } = self.strategy {
            if self.sources.len() != 2 {
                return Err(invalid("partitioned strategy needs exactly two sources"));
            }
        }
        Ok(())
    }
}

/// Registry of every runnable model.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    pub fn new(entries: Vec<ModelEntry>) -> Result<Self, ConfigurationError> {
        let mut registry = Self::default();
        registry.extend(entries)?;
        Ok(registry)
    }

    /// Add entries, replacing any existing entry with the same name.
    pub fn extend(&mut self, entries: Vec<ModelEntry>) -> Result<(), ConfigurationError> {
        for entry in entries {
            entry.validate()?;
            self.models.insert(entry.name.clone(), entry);
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Result<&ModelEntry, ConfigurationError> {
        self.models
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownModel(name.to_string()))
    }

    /// Ordered descriptors for `(model, event_type)`, primary first.
    pub fn resolve(
        &self,
        model: &str,
        event_type: EventType,
    ) -> Result<Vec<DatasetDescriptor>, ConfigurationError> {
        let entry = self.get(model)?;
        if !entry.event_types.contains(&event_type) {
            return Err(ConfigurationError::UnsupportedEventType {
                model: model.to_string(),
                event_type: event_type.to_string(),
            });
        }
        Ok(entry
            .sources
            .iter()
            .map(|source| DatasetDescriptor::from_config(model, event_type, source))
            .collect())
    }

    /// Check that every credential the model may need is available.
    pub fn verify_credentials(&self, model: &str) -> Result<(), ConfigurationError> {
        let entry = self.get(model)?;
        entry
            .sources
            .iter()
            .try_for_each(|source| source.credentials.verify(model))
    }

    /// Models used by the benchmark paper.
    pub fn builtin() -> Self {
        let mut models = BTreeMap::new();
        for entry in builtin_entries() {
            models.insert(entry.name.clone(), entry);
        }
        Self { models }
    }
}

const ICECHUNK_BUCKET: &str = "extremeweatherbench";
const GCS_CREDENTIALS_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const ARRAYLAKE_TOKEN_VAR: &str = "ARRAYLAKE_TOKEN";

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

fn window(start: NaiveDate, end: NaiveDate) -> Option<DateInterval> {
    DateInterval::new(start, end).ok()
}

fn location(uri: &str) -> crate::domain::StorageLocation {
    uri.parse().unwrap_or(crate::domain::StorageLocation::Memory {
        name: uri.to_string(),
    })
}

fn hres_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            kind: SourceKind::Zarr,
            location: location("gs://weatherbench2/datasets/hres/2016-2022-0012-1440x721.zarr"),
            display_name: "ECMWF HRES".to_string(),
            credentials: CredentialsRef::Anonymous,
            storage_options: StorageOptions {
                remote_protocol: None,
                anonymous: true,
            },
            variable_mapping: BTreeMap::new(),
            coverage: window(date(2016, 1, 1), date(2022, 12, 31)),
        },
        SourceConfig {
            kind: SourceKind::Arraylake,
            location: location("arraylake://brightband/ecmwf@main/forecast-archive/ewb-hres"),
            display_name: "ECMWF HRES".to_string(),
            credentials: CredentialsRef::Env {
                var: ARRAYLAKE_TOKEN_VAR.to_string(),
            },
            storage_options: StorageOptions::default(),
            variable_mapping: [("t2m".to_string(), "surface_air_temperature".to_string())].into(),
            coverage: None,
        },
    ]
}

fn cira_source(archive: &str, display: &str, init: &str) -> SourceConfig {
    SourceConfig {
        kind: SourceKind::Kerchunk,
        location: location(&format!("gs://extremeweatherbench/{archive}_{init}.parq")),
        display_name: format!("CIRA {display} {init}"),
        credentials: CredentialsRef::Anonymous,
        storage_options: StorageOptions {
            remote_protocol: Some("s3".to_string()),
            anonymous: true,
        },
        variable_mapping: [("t2".to_string(), "surface_air_temperature".to_string())].into(),
        coverage: None,
    }
}

fn bb_source(display: &str, prefix: &str, credentials_prefix: &str) -> SourceConfig {
    SourceConfig {
        kind: SourceKind::Icechunk,
        location: location(&format!("icechunk://{ICECHUNK_BUCKET}/{prefix}")),
        display_name: format!("BB {display}"),
        credentials: CredentialsRef::Prefix {
            prefix: credentials_prefix.to_string(),
            var: GCS_CREDENTIALS_VAR.to_string(),
        },
        storage_options: StorageOptions::default(),
        variable_mapping: [
            ("2m_temperature", "surface_air_temperature"),
            ("2m_dewpoint_temperature", "surface_dewpoint_temperature"),
            ("10m_u_component_of_wind", "surface_eastward_wind"),
            ("10m_v_component_of_wind", "surface_northward_wind"),
            ("temperature", "air_temperature"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
        coverage: window(date(2021, 1, 2), date(2024, 12, 31)),
    }
}

fn builtin_entries() -> Vec<ModelEntry> {
    let all: BTreeSet<EventType> = EventType::ALL.into_iter().collect();
    // HRES is a coverage-limited fallback rather than a split at 2023-01-01:
    // cases inside the zarr window (2016-2022) go to zarr, later ones find it
    // uncovered and fall through to arraylake. The two differ only for cases
    // touching the cutoff, which a split would drop or send early.
    let mut entries = vec![ModelEntry {
        name: "hres".to_string(),
        event_types: all.clone(),
        strategy: ResolutionStrategy::Fallback,
        sources: hres_sources(),
    }];

    for (name, archive, display) in [
        ("fourv2", "FOUR_v200", "FOURv2"),
        ("gc", "GRAP_v100", "GC"),
        ("pangu", "PANG_v100", "PANG"),
    ] {
        for init in ["IFS", "GFS"] {
            entries.push(ModelEntry {
                name: format!("cira_{name}_{}", init.to_ascii_lowercase()),
                event_types: all.clone(),
                strategy: ResolutionStrategy::Fallback,
                sources: vec![cira_source(archive, display, init)],
            });
        }
    }

    for (name, display, prefix, credentials_prefix) in [
        (
            "bb_aifs",
            "AIFS",
            "aifs-single_20210102-20241231_icechunk",
            "gs://brightband-scratch/darothen/aifs-single-archive/",
        ),
        (
            "bb_graphcast",
            "Graphcast",
            "graphcast-20210102-20241231_icechunk",
            "gs://brightband-scratch/darothen/graphcast-archive/",
        ),
        (
            "bb_pangu",
            "Pangu",
            "panguweather-20210102-20241231_icechunk",
            "gs://brightband-scratch/darothen/panguweather-archive/",
        ),
    ] {
        entries.push(ModelEntry {
            name: name.to_string(),
            event_types: all.clone(),
            strategy: ResolutionStrategy::Fallback,
            sources: vec![bb_source(display, prefix, credentials_prefix)],
        });
    }
    entries
}
