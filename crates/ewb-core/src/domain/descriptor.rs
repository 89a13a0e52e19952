//! Dataset descriptors: where forecast data lives, before anything is opened.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::case::EventType;
use super::error::ConfigurationError;
use super::interval::DateInterval;

/// Storage format of a forecast archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Kerchunk reference parquet over remote netCDF/GRIB.
    Kerchunk,
    Zarr,
    Arraylake,
    /// Icechunk repository, loaded into the process as one dataset.
    Icechunk,
    /// Dataset constructed in-process (tests, pre-loaded arrays).
    Memory,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Kerchunk => "kerchunk",
            SourceKind::Zarr => "zarr",
            SourceKind::Arraylake => "arraylake",
            SourceKind::Icechunk => "icechunk",
            SourceKind::Memory => "memory",
        }
    }

    /// In-memory sources live in one process and cannot be cheaply duplicated
    /// per worker, so the scheduler caps their concurrency.
    pub fn is_in_memory(&self) -> bool {
        matches!(self, SourceKind::Icechunk | SourceKind::Memory)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StorageLocation {
    /// `gs://bucket/path` or `s3://bucket/path`
    ObjectStore {
        scheme: String,
        bucket: String,
        path: String,
    },
    /// `arraylake://org/repo[@branch]/group/...`
    Arraylake {
        org: String,
        repo: String,
        branch: String,
        group: String,
    },
    /// `icechunk://bucket/prefix`
    Icechunk { bucket: String, prefix: String },
    /// `memory://name`
    Memory { name: String },
}

impl FromStr for StorageLocation {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigurationError::InvalidLocation {
            location: s.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if rest.is_empty() {
            return Err(invalid("empty path"));
        }

        match scheme {
            "gs" | "s3" => {
                let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(invalid("empty bucket"));
                }
                Ok(StorageLocation::ObjectStore {
                    scheme: scheme.to_string(),
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                })
            }
            "arraylake" => {
                let mut bits = rest.split('/');
                let org = bits.next().filter(|b| !b.is_empty()).ok_or_else(|| invalid("missing org"))?;
                let repo_part = bits
                    .next()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| invalid("missing repo"))?;
                let (repo, branch) = match repo_part.split_once('@') {
                    Some((repo, branch)) if !repo.is_empty() && !branch.is_empty() => (repo, branch),
                    Some(_) => return Err(invalid("malformed repo@branch")),
                    None => (repo_part, "main"),
                };
                let group = bits.collect::<Vec<_>>().join("/");
                Ok(StorageLocation::Arraylake {
                    org: org.to_string(),
                    repo: repo.to_string(),
                    branch: branch.to_string(),
                    group,
                })
            }
            "icechunk" => {
                let (bucket, prefix) = rest
                    .split_once('/')
                    .filter(|(b, p)| !b.is_empty() && !p.is_empty())
                    .ok_or_else(|| invalid("expected icechunk://bucket/prefix"))?;
                Ok(StorageLocation::Icechunk {
                    bucket: bucket.to_string(),
                    prefix: prefix.to_string(),
                })
            }
            "memory" => Ok(StorageLocation::Memory {
                name: rest.to_string(),
            }),
            other => Err(invalid(&format!("unsupported scheme '{other}'"))),
        }
    }
}

impl TryFrom<String> for StorageLocation {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorageLocation> for String {
    fn from(location: StorageLocation) -> Self {
        location.to_string()
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::ObjectStore {
                scheme,
                bucket,
                path,
            } if path.is_empty() => write!(f, "{scheme}://{bucket}"),
            StorageLocation::ObjectStore {
                scheme,
                bucket,
                path,
            } => write!(f, "{scheme}://{bucket}/{path}"),
            StorageLocation::Arraylake {
                org,
                repo,
                branch,
                group,
            } => {
                write!(f, "arraylake://{org}/{repo}@{branch}")?;
                if !group.is_empty() {
                    write!(f, "/{group}")?;
                }
                Ok(())
            }
            StorageLocation::Icechunk { bucket, prefix } => {
                write!(f, "icechunk://{bucket}/{prefix}")
            }
            StorageLocation::Memory { name } => write!(f, "memory://{name}"),
        }
    }
}

/// How a source authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialsRef {
    #[default]
    Anonymous,
    /// Credentials come from an environment variable.
    Env { var: String },
    /// Environment credentials scoped to virtual chunks under `prefix`.
    Prefix { prefix: String, var: String },
}

impl CredentialsRef {
    pub fn env_var(&self) -> Option<&str> {
        match self {
            CredentialsRef::Anonymous => None,
            CredentialsRef::Env { var } | CredentialsRef::Prefix { var, .. } => Some(var),
        }
    }

    /// Fail when the referenced environment variable is not set.
    pub fn verify(&self, model: &str) -> Result<(), ConfigurationError> {
        match self.env_var() {
            Some(var) if std::env::var_os(var).is_none() => {
                Err(ConfigurationError::MissingCredentials {
                    model: model.to_string(),
                    var: var.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Typed replacement for free-form `storage_options` dictionaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StorageOptions {
    /// Protocol of the referenced chunks (Kerchunk), e.g. `s3`.
    #[serde(default)]
    pub remote_protocol: Option<String>,
    /// Read without credentials.
    #[serde(default)]
    pub anonymous: bool,
}

/// A source as configured in the registry, independent of event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub location: StorageLocation,
    /// Name reported in result records, e.g. `ECMWF HRES`.
    pub display_name: String,
    #[serde(default)]
    pub credentials: CredentialsRef,
    #[serde(default)]
    pub storage_options: StorageOptions,
    #[serde(default)]
    pub variable_mapping: BTreeMap<String, String>,
    /// Dates the archive can serve. Cases outside are not dispatched.
    #[serde(default)]
    pub coverage: Option<DateInterval>,
}

/// Where data for one (model, event type) lives. Pure data; opening it is
/// the job of a [`DatasetOpener`](crate::source::DatasetOpener).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub model_name: String,
    pub event_type: EventType,
    pub kind: SourceKind,
    pub display_name: String,
    pub storage_location: StorageLocation,
    pub credentials_ref: CredentialsRef,
    pub storage_options: StorageOptions,
    pub variable_mapping: BTreeMap<String, String>,
    pub coverage: Option<DateInterval>,
}

impl DatasetDescriptor {
    pub fn from_config(model_name: &str, event_type: EventType, config: &SourceConfig) -> Self {
        Self {
            model_name: model_name.to_string(),
            event_type,
            kind: config.kind,
            display_name: config.display_name.clone(),
            storage_location: config.location.clone(),
            credentials_ref: config.credentials.clone(),
            storage_options: config.storage_options.clone(),
            variable_mapping: config.variable_mapping.clone(),
            coverage: config.coverage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_store_uri() {
        let loc: StorageLocation = "gs://weatherbench2/datasets/hres/2016-2022-0012-1440x721.zarr"
            .parse()
            .unwrap();
        match &loc {
            StorageLocation::ObjectStore {
                scheme,
                bucket,
                path,
            } => {
                assert_eq!(scheme, "gs");
                assert_eq!(bucket, "weatherbench2");
                assert_eq!(path, "datasets/hres/2016-2022-0012-1440x721.zarr");
            }
            other => panic!("unexpected location {other:?}"),
        }
        assert_eq!(
            loc.to_string(),
            "gs://weatherbench2/datasets/hres/2016-2022-0012-1440x721.zarr"
        );
    }

    #[test]
    fn test_parse_arraylake_defaults_branch_to_main() {
        let loc: StorageLocation = "arraylake://brightband/ecmwf/forecast-archive/ewb-hres"
            .parse()
            .unwrap();
        assert_eq!(
            loc,
            StorageLocation::Arraylake {
                org: "brightband".to_string(),
                repo: "ecmwf".to_string(),
                branch: "main".to_string(),
                group: "forecast-archive/ewb-hres".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_arraylake_with_branch() {
        let loc: StorageLocation = "arraylake://brightband/ecmwf@dev/archive".parse().unwrap();
        match loc {
            StorageLocation::Arraylake { repo, branch, .. } => {
                assert_eq!(repo, "ecmwf");
                assert_eq!(branch, "dev");
            }
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_malformed_locations() {
        for bad in [
            "weatherbench2/hres.zarr",
            "ftp://host/file",
            "gs://",
            "arraylake://brightband",
            "arraylake://brightband/@main/x",
            "icechunk://bucket-only",
        ] {
            assert!(bad.parse::<StorageLocation>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_source_config_deserializes_typed_options() {
        let cfg: SourceConfig = toml::from_str(
            r#"
            kind = "kerchunk"
            location = "gs://extremeweatherbench/FOUR_v200_GFS.parq"
            display_name = "CIRA FOURv2 GFS"
            storage_options = { remote_protocol = "s3", anonymous = true }
            variable_mapping = { t2 = "surface_air_temperature" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.kind, SourceKind::Kerchunk);
        assert_eq!(cfg.credentials, CredentialsRef::Anonymous);
        assert!(cfg.storage_options.anonymous);
        assert_eq!(cfg.variable_mapping["t2"], "surface_air_temperature");
    }

    #[test]
    fn test_source_config_rejects_unknown_option() {
        let res = toml::from_str::<SourceConfig>(
            r#"
            kind = "zarr"
            location = "gs://bucket/x.zarr"
            display_name = "x"
            storage_options = { remote_options = "anon" }
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_missing_credentials_detected() {
        let creds = CredentialsRef::Env {
            var: "EWB_TEST_SURELY_UNSET_CREDENTIAL_VAR".to_string(),
        };
        assert!(creds.verify("bb_aifs").is_err());
        assert!(CredentialsRef::Anonymous.verify("hres").is_ok());
    }

    #[test]
    fn test_in_memory_kinds() {
        assert!(SourceKind::Icechunk.is_in_memory());
        assert!(SourceKind::Memory.is_in_memory());
        assert!(!SourceKind::Zarr.is_in_memory());
    }
}
