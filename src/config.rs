//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::AdapterSpec;
use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Answer detected prompts through adapter policies instead of asking
    #[serde(default)]
    pub auto_approve: bool,

    /// Session persistence settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Output classifier settings
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Process runner settings
    #[serde(default)]
    pub process: ProcessConfig,

    /// External catalog location
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Inline adapter definitions, overriding catalog entries by name
    #[serde(default)]
    pub adapters: HashMap<String, AdapterSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_approve: false,
            session: SessionConfig::default(),
            classifier: ClassifierConfig::default(),
            process: ProcessConfig::default(),
            catalog: CatalogConfig::default(),
            adapters: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .cadence/config.toml in current directory
            let local = PathBuf::from(".cadence/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.cadence/config.toml
            dirs::home_dir().map(|h| h.join(".cadence/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => Self::parse(&std::fs::read_to_string(&p)?),
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Directory holding session snapshots: `<base_dir>/<namespace>/sessions`
    pub fn sessions_dir(&self) -> PathBuf {
        self.session
            .resolved_base_dir()
            .join(&self.session.namespace)
            .join("sessions")
    }
}

/// Session persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Root directory for engine state (`~` is expanded)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Namespace separating independent hosts sharing one base directory
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".cadence")
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            namespace: default_namespace(),
        }
    }
}

impl SessionConfig {
    /// Base directory with `~` and environment variables expanded
    pub fn resolved_base_dir(&self) -> PathBuf {
        let raw = self.base_dir.to_string_lossy();
        match shellexpand::full(&raw) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => self.base_dir.clone(),
        }
    }
}

/// Output classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Maximum bytes of recent output kept per task
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_buffer_capacity() -> usize {
    4096
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

/// Process runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Initial terminal width for interactive tasks
    #[serde(default = "default_cols")]
    pub cols: u16,

    /// Initial terminal height for interactive tasks
    #[serde(default = "default_rows")]
    pub rows: u16,

    /// How long to keep reading output after a process exits
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub exit_drain_timeout: Duration,
}

fn default_cols() -> u16 {
    120
}

fn default_rows() -> u16 {
    40
}

fn default_drain_timeout() -> Duration {
    Duration::from_millis(500)
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
            exit_drain_timeout: default_drain_timeout(),
        }
    }
}

/// Catalog location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// TOML or JSON file with adapter entries
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Initialize .cadence directory with a default config
pub fn init(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let config_path = dir.join("config.toml");
    if !config_path.exists() {
        let content =
            toml::to_string_pretty(&Config::default()).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, content)?;
    }

    Ok(config_path)
}

// Custom serde module for Duration using humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
