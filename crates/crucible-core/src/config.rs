//! Configuration system for Crucible.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CRUCIBLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/crucible/config.toml
//!   3. ~/.config/crucible/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrucibleConfig {
    pub scripts: ScriptSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    /// Directory holding the executable scripts, keyed by script name.
    pub script_dir: PathBuf,
    /// Interpreter the scripts are launched with.
    pub interpreter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory where per-task named pipes are created.
    pub pipe_dir: PathBuf,
    /// Per-phase timeout used when a request doesn't carry one.
    pub default_timeout_minutes: u64,
    /// Seconds between SIGTERM and SIGKILL when cancelling.
    pub kill_grace_secs: u64,
    /// Time-to-live for published results in the dedup cache. In-flight
    /// claims get their own TTL, sized to the execution timeout.
    pub cache_ttl_secs: u64,
    /// Poll interval for callers blocked on another owner's claim.
    pub claim_poll_ms: u64,
}

impl EngineSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn claim_poll(&self) -> Duration {
        Duration::from_millis(self.claim_poll_ms)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            scripts: ScriptSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            script_dir: data_dir().join("scripts"),
            interpreter: "python3".to_string(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pipe_dir: PathBuf::from("/tmp/crucible"),
            default_timeout_minutes: 60,
            kill_grace_secs: 10,
            cache_ttl_secs: 300,
            claim_poll_ms: 100,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("crucible")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("crucible")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CrucibleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CrucibleConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CRUCIBLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CrucibleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CRUCIBLE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CRUCIBLE_SCRIPTS__SCRIPT_DIR") {
            self.scripts.script_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CRUCIBLE_SCRIPTS__INTERPRETER") {
            self.scripts.interpreter = v;
        }
        if let Ok(v) = std::env::var("CRUCIBLE_ENGINE__PIPE_DIR") {
            self.engine.pipe_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CRUCIBLE_ENGINE__DEFAULT_TIMEOUT_MINUTES") {
            if let Ok(n) = v.parse() {
                self.engine.default_timeout_minutes = n;
            }
        }
        if let Ok(v) = std::env::var("CRUCIBLE_ENGINE__KILL_GRACE_SECS") {
            if let Ok(n) = v.parse() {
                self.engine.kill_grace_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CRUCIBLE_ENGINE__CACHE_TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.engine.cache_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CRUCIBLE_ENGINE__CLAIM_POLL_MS") {
            if let Ok(n) = v.parse() {
                self.engine.claim_poll_ms = n;
            }
        }
    }
}
