//! CLI configuration for `plinth`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Every setting can be overridden by a command-line flag.

use std::path::PathBuf;

/// Resolved CLI configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Path to the cluster specification YAML.
    pub spec_path: PathBuf,
    /// Data directory; the secret snapshot lives at `<data>/secret-data.json`.
    pub data_dir: PathBuf,
    /// Directory for template execution details, if recording is enabled.
    pub template_details_dir: Option<PathBuf>,
    /// Log filter (e.g., `info`, `debug`, `plinth_core=trace`).
    pub log_level: String,
}

/// Values given on the command line; `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub spec_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub template_details_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PLINTH_SPEC`: cluster specification path (default: `./clusters.yaml`)
    /// - `PLINTH_DATA_DIR`: data directory (default: `./data`)
    /// - `PLINTH_TEMPLATE_DETAILS_DIR`: template details directory (optional)
    /// - `PLINTH_LOG_LEVEL`: log filter (default: `info`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            spec_path: non_empty("PLINTH_SPEC")
                .map_or_else(|| PathBuf::from("./clusters.yaml"), PathBuf::from),
            data_dir: non_empty("PLINTH_DATA_DIR")
                .map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            template_details_dir: non_empty("PLINTH_TEMPLATE_DETAILS_DIR").map(PathBuf::from),
            log_level: non_empty("PLINTH_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
        }
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(path) = overrides.spec_path {
            self.spec_path = path;
        }
        if let Some(dir) = overrides.data_dir {
            self.data_dir = dir;
        }
        if overrides.template_details_dir.is_some() {
            self.template_details_dir = overrides.template_details_dir;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        self
    }
}
