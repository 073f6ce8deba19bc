use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::constants::{
    DEFAULT_HISTORY_TURNS, DEFAULT_MAX_ITERATIONS, DEFAULT_TOOL_TIMEOUT_SECONDS,
};

/// One configured remote tool server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct McpServerConfig {
    pub id: String,
    pub display_name: String,
    /// Transport kind: "stdio" (spawned child process) or "http".
    pub transport: Option<String>,
    /// Launch command for stdio servers.
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    /// Endpoint URL for HTTP servers.
    pub base_url: Option<String>,
    /// Extra headers sent with every HTTP request.
    pub headers: Option<HashMap<String, String>>,
    /// Per-request timeout for this server's protocol round trips.
    pub timeout_seconds: Option<u64>,
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Bounds applied to every agent run.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_tool_timeout_seconds")]
    pub tool_timeout_seconds: u64,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

fn default_history_turns() -> usize {
    DEFAULT_HISTORY_TURNS
}

fn default_tool_timeout_seconds() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECONDS
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            history_turns: DEFAULT_HISTORY_TURNS,
            tool_timeout_seconds: DEFAULT_TOOL_TIMEOUT_SECONDS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub agent: Option<AgentSettings>,
    /// Root for durable runtime artifacts (run state, discovery cache).
    pub state_dir: Option<PathBuf>,
    /// Working-directory root handed to tool executions.
    pub workdir: Option<PathBuf>,
}

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Failed to write the configuration file back to disk.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Write { path, source } => {
                write!(
                    f,
                    "Failed to write config at {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Write { source, .. } => Some(source),
        }
    }
}

impl Config {
    pub fn load() -> Result<Config, ConfigError> {
        Self::load_from_path(&Self::config_path())
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source,
        };
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source: std::io::Error::other(source),
        })?;
        fs::write(config_path, contents).map_err(write_err)
    }

    pub fn config_path() -> PathBuf {
        match ProjectDirs::from("org", "permacommons", "agentry") {
            Some(dirs) => dirs.config_dir().join("config.toml"),
            None => PathBuf::from("agentry.toml"),
        }
    }

    /// Resolved state root: the configured one, else the platform data dir.
    pub fn state_root(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        match ProjectDirs::from("org", "permacommons", "agentry") {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            None => PathBuf::from("."),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        self.agent.clone().unwrap_or_default()
    }

    pub fn find_server(&self, id: &str) -> Option<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }
}
