//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, the first JSON file found,
//! a named preset, `LLMCOMMIT_*` environment variables (a `.env` file works
//! too), then command-line flags applied by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::daemon::protocol::default_socket_path;
use crate::engine::EngineKind;

pub const DEFAULT_MODEL: &str = "distilgpt2";
pub const DEFAULT_MAX_DIFF_CHARS: usize = 1000;
pub const DEFAULT_PROMPT_TEMPLATE: &str =
    "Generate a concise git commit message for these changes:\n{diff}\n\nCommit message:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model id; part of every cache key.
    pub model: String,
    pub engine: EngineKind,
    /// Argv of the external runner used by the `command` engine.
    pub command: Vec<String>,
    /// Prompt with a `{diff}` placeholder.
    pub prompt_template: String,
    /// Diff characters substituted into the prompt.
    pub max_diff_chars: usize,
    pub cache_dir: Option<PathBuf>,
    pub daemon_socket: Option<PathBuf>,
    /// Directory for the daemon PID file and log.
    pub state_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on `daemon stop`.
    pub stop_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            engine: EngineKind::Rules,
            command: vec!["ollama".into(), "run".into(), "{model}".into()],
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            max_diff_chars: DEFAULT_MAX_DIFF_CHARS,
            cache_dir: None,
            daemon_socket: None,
            state_dir: None,
            request_timeout_secs: 120,
            stop_timeout_secs: 5,
        }
    }
}

/// Named bundles of engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Preset {
    /// Rule-based messages, no model load.
    Fast,
    /// Pipe the prompt through a local LLM runner.
    Command,
}

impl Preset {
    pub fn apply(self, config: &mut Config) {
        match self {
            Preset::Fast => config.engine = EngineKind::Rules,
            Preset::Command => {
                config.engine = EngineKind::Command;
                config.prompt_template =
                    "Write a clear git commit message for:\n{diff}\n\nCommit:".to_string();
            }
        }
    }
}

impl Config {
    /// Load using the standard search path (`~/.llmcommit/config.json`, then
    /// `./.llmcommit.json`) unless `explicit` names a file.
    pub fn load(explicit: Option<&Path>, preset: Option<Preset>) -> Result<Self, ConfigError> {
        Self::load_from(explicit, &default_config_paths(), preset)
    }

    pub fn load_from(
        explicit: Option<&Path>,
        candidates: &[PathBuf],
        preset: Option<Preset>,
    ) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match candidates.iter().find(|p| p.is_file()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };

        if let Some(preset) = preset {
            preset.apply(&mut config);
        }
        config.apply_env();
        config.cache_dir = config.cache_dir.map(|dir| expand_tilde(&dir));
        config.state_dir = config.state_dir.map(|dir| expand_tilde(&dir));
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        debug!(path = %path.display(), "Loaded config file");
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(model) = dotenvy::var("LLMCOMMIT_MODEL") {
            self.model = model;
        }
        if let Ok(dir) = dotenvy::var("LLMCOMMIT_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(path) = dotenvy::var("LLMCOMMIT_DAEMON_SOCKET") {
            self.daemon_socket = Some(PathBuf::from(path));
        }
        if let Ok(dir) = dotenvy::var("LLMCOMMIT_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Ok(val) = dotenvy::var("LLMCOMMIT_DAEMON_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            self.request_timeout_secs = secs;
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon_socket.clone().unwrap_or_else(default_socket_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// JSON form recorded alongside a loaded model.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "llmcommit", "llmcommit")
}

pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = directories::BaseDirs::new() {
        paths.push(base.home_dir().join(".llmcommit").join("config.json"));
    }
    paths.push(PathBuf::from(".llmcommit.json"));
    paths
}

pub fn default_cache_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("llmcommit_cache"))
}

/// Holds the daemon PID file and log.
pub fn default_state_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("llmcommit"))
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match directories::BaseDirs::new() {
        Some(base) => base.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}
