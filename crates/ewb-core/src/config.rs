//! `config.toml` loading.
//!
//! Lookup order: an explicit path, then `./config.toml`, then
//! `~/.config/ewb/config.toml`, then built-in defaults. Every section is
//! optional.
//!
//! ```toml
//! [paths]
//! basepath = "~/extreme-weather-bench-paper"
//!
//! [parallel]
//! backend = "loky"
//! n_jobs = 32
//!
//! [evaluator]
//! program = "ewb-evaluate"
//! timeout_secs = 1800
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::domain::{default_evaluations, ConfigurationError, EvaluationSpec, EventType};
use crate::external::CommandConfig;
use crate::registry::{ModelEntry, ModelRegistry};
use crate::scheduler::ParallelConfig;

/// Environment variable overriding the default basepath.
pub const BASEPATH_ENV: &str = "EWB_BASEPATH";
const DEFAULT_BASEPATH: &str = "extreme-weather-bench-paper";
const USER_CONFIG: &str = ".config/ewb/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub basepath: Option<PathBuf>,
    /// Checkpoint directory. Defaults to `<basepath>/saved_data`.
    pub saved_data: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// JSON case catalog. Defaults to `<basepath>/cases.json`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenerConfig {
    pub handshake: Option<CommandConfig>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub parallel: ParallelConfig,
    pub catalog: CatalogConfig,
    pub evaluator: Option<CommandConfig>,
    pub opener: OpenerConfig,
    /// Replaces the default evaluations when non-empty.
    pub evaluations: Vec<EvaluationSpec>,
    /// Added to the builtin registry, replacing entries of the same name.
    pub models: Vec<ModelEntry>,
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Config {
    /// Load with the standard lookup order. `explicit` must exist if given.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigurationError> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        let local = PathBuf::from("config.toml");
        if local.is_file() {
            return Self::from_path(&local);
        }
        if let Some(user) = home_dir().map(|home| home.join(USER_CONFIG)) {
            if user.is_file() {
                return Self::from_path(&user);
            }
        }
        debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigurationError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|source| ConfigurationError::ParseConfig {
                path: path.to_path_buf(),
                source,
            })?;
        config.source = Some(path.to_path_buf());
        config.validate()?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// File the config was read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut seen = BTreeSet::new();
        for spec in &self.evaluations {
            if !seen.insert((spec.event_type, spec.target_name().to_string())) {
                return Err(ConfigurationError::DuplicateEvaluation {
                    event_type: spec.event_type.to_string(),
                    target: spec.target_name().to_string(),
                });
            }
        }
        self.models.iter().try_for_each(ModelEntry::validate)
    }

    /// `[paths] basepath`, else `$EWB_BASEPATH`, else
    /// `~/extreme-weather-bench-paper`.
    pub fn basepath(&self) -> PathBuf {
        if let Some(path) = &self.paths.basepath {
            return expand_home(path);
        }
        if let Some(env) = std::env::var_os(BASEPATH_ENV) {
            return expand_home(Path::new(&env));
        }
        home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_BASEPATH)
    }

    pub fn output_dir(&self) -> PathBuf {
        match &self.paths.saved_data {
            Some(path) => expand_home(path),
            None => self.basepath().join("saved_data"),
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        match &self.catalog.path {
            Some(path) => expand_home(path),
            None => self.basepath().join("cases.json"),
        }
    }

    /// Builtin models plus `[[models]]`.
    pub fn registry(&self) -> Result<ModelRegistry, ConfigurationError> {
        let mut registry = ModelRegistry::builtin();
        registry.extend(self.models.clone())?;
        Ok(registry)
    }

    /// Evaluations to run for `event_type`. Never empty.
    pub fn evaluations_for(&self, event_type: EventType) -> Result<Vec<EvaluationSpec>, ConfigurationError> {
        let configured = if self.evaluations.is_empty() {
            default_evaluations()
        } else {
            self.evaluations.clone()
        };
        let specs: Vec<EvaluationSpec> = configured
            .into_iter()
            .filter(|spec| spec.event_type == event_type)
            .collect();

        if specs.is_empty() {
            return Err(ConfigurationError::NoEvaluations(event_type.to_string()));
        }
        Ok(specs)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Replace a leading `~` with `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
