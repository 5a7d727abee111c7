use std::path::{Path, PathBuf};

use chipstream::recent::DEFAULT_RECENT_CAPACITY;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};

const APP_DIR: &str = "chipstream";
const CONFIG_FILE: &str = "config.toml";
const RECENT_FILE: &str = "recent_output_dirs.txt";

/// Pipeline program used when neither `--engine` nor the config names one.
pub const DEFAULT_ENGINE: &str = "dcnum-pipeline";

/// Settings read from `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Pipeline executable.
    pub engine: PathBuf,
    /// Extra arguments placed before the job file.
    pub engine_args: Vec<String>,
    /// Default number of worker processes.
    pub num_cpus: Option<usize>,
    /// Keep intermediate files of successful jobs.
    pub keep_intermediates: bool,
    /// Number of remembered output directories.
    pub recent_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: PathBuf::from(DEFAULT_ENGINE),
            engine_args: Vec::new(),
            num_cpus: None,
            keep_intermediates: false,
            recent_capacity: DEFAULT_RECENT_CAPACITY,
        }
    }
}

fn app_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR))
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        app_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// File holding the recently used output directories.
    pub fn recent_dirs_path() -> Option<PathBuf> {
        app_dir().map(|dir| dir.join(RECENT_FILE))
    }

    /// Load the configuration.
    ///
    /// An explicitly given file must exist; a missing default file yields the
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(AppError::Config(format!(
                        "configuration file not found: {}",
                        path.display()
                    )));
                }
                Self::from_file(path)
            }
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => {
                    debug!("No configuration file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.recent_capacity == 0 {
            return Err(AppError::Config("recent_capacity must be at least 1".into()));
        }
        Ok(config)
    }
}
