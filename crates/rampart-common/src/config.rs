//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Shared primitives and utilities for the resilience runtime."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Logging section shared by every configuration document in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the rolling JSON log file. Stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// A parsed configuration document together with the path it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig<T> {
    pub config: T,
    pub source: PathBuf,
}

/// Load a TOML document, preferring the path named by `env_var` over `candidates`.
///
/// Candidates are inspected in order and the first existing file wins. An empty
/// environment variable is treated as unset.
pub fn load_toml_with_source<T, P>(env_var: &str, candidates: &[P]) -> Result<LoadedConfig<T>>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    if let Ok(env_path) = std::env::var(env_var) {
        if !env_path.trim().is_empty() {
            let path = PathBuf::from(env_path);
            let config = read_toml(&path)?;
            return Ok(LoadedConfig {
                config,
                source: path,
            });
        }
    }

    for candidate in candidates {
        if candidate.as_ref().exists() {
            let path = candidate.as_ref().to_path_buf();
            let config = read_toml(&path)?;
            return Ok(LoadedConfig {
                config,
                source: path,
            });
        }
    }

    Err(anyhow!(
        "no configuration files found. inspected: {}",
        candidates
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

/// Read and parse a single TOML file.
pub fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!(config_path = %path.display(), "loading configuration");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {}", path.display()))?;
    toml::from_str::<T>(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Doc {
        name: String,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("present.toml");
        fs::write(&present, "name = \"present\"\n[logging]\nformat = \"pretty\"\n").unwrap();

        let loaded: LoadedConfig<Doc> =
            load_toml_with_source("RAMPART_TEST_UNSET_VAR", &[&missing, &present]).unwrap();
        assert_eq!(loaded.config.name, "present");
        assert_eq!(loaded.config.logging.format, LogFormat::Pretty);
        assert_eq!(loaded.source, present);
    }

    #[test]
    fn missing_candidates_are_listed_in_error() {
        let err = load_toml_with_source::<Doc, _>("RAMPART_TEST_UNSET_VAR", &["nope.toml"])
            .unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn parse_errors_carry_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "name = ").unwrap();
        let err = read_toml::<Doc>(&broken).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }
}
