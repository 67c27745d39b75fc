//! Configuration for the Godot soft-debugger launcher.
//!
//! A project may carry a `.godot-sdb.toml` next to its `project.godot`. Every
//! key is optional; missing sections fall back to the documented defaults.
//!
//! ```toml
//! [agent]
//! host = "127.0.0.1"
//! port = 0
//! connect_timeout_ms = 5000
//!
//! [launch]
//! mode = "launch"
//! godot_executable = "/opt/godot/Godot_v4.2-stable_mono"
//!
//! [logging]
//! level = "sdb.session=debug,info"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;

pub use logging::{init_tracing, LoggingConfig};

pub const CONFIG_FILE_NAME: &str = ".godot-sdb.toml";
/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "GODOT_SDB_CONFIG";

/// Smallest frame the agent can send: the 11-byte packet header.
const MIN_PACKET_BYTES: usize = 11;
const MAX_PACKET_BYTES_LIMIT: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep just the message; the default `Display` embeds a source snippet.
        ConfigError::Toml(err.message().to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address the debug agent connection uses. In launch mode this is where
    /// we listen; in attach mode it is where the target listens.
    #[serde(default = "AgentConfig::default_host")]
    pub host: String,

    /// `0` picks an ephemeral port in launch mode. Attach mode needs a real port.
    #[serde(default)]
    pub port: u16,

    /// Deadline for the target to connect back (launch) or for all connect
    /// attempts together (attach).
    #[serde(default = "AgentConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a graceful detach waits for the agent to acknowledge.
    #[serde(default = "AgentConfig::default_detach_timeout_ms")]
    pub detach_timeout_ms: u64,

    #[serde(default = "AgentConfig::default_max_packet_bytes")]
    pub max_packet_bytes: usize,

    #[serde(default = "AgentConfig::default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "AgentConfig::default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "AgentConfig::default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl AgentConfig {
    fn default_host() -> String {
        "127.0.0.1".to_owned()
    }

    fn default_connect_timeout_ms() -> u64 {
        5_000
    }

    fn default_detach_timeout_ms() -> u64 {
        2_000
    }

    fn default_max_packet_bytes() -> usize {
        16 * 1024 * 1024
    }

    fn default_connect_attempts() -> u32 {
        10
    }

    fn default_backoff_initial_ms() -> u64 {
        100
    }

    fn default_backoff_max_ms() -> u64 {
        1_000
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn detach_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("agent.host {:?} is not an IP address", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: 0,
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            detach_timeout_ms: Self::default_detach_timeout_ms(),
            max_packet_bytes: Self::default_max_packet_bytes(),
            connect_attempts: Self::default_connect_attempts(),
            backoff_initial_ms: Self::default_backoff_initial_ms(),
            backoff_max_ms: Self::default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Spawn the game and wait for its agent to connect back.
    #[default]
    Launch,
    /// Connect to a game whose agent is already listening.
    Attach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default)]
    pub mode: LaunchMode,

    /// Path to the Mono-enabled Godot binary. Required in launch mode.
    #[serde(default)]
    pub godot_executable: Option<PathBuf>,

    /// Appended after `--path <project>`.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Start the game suspended so breakpoints in startup code bind in time.
    #[serde(default = "LaunchConfig::default_suspend_on_start")]
    pub suspend_on_start: bool,
}

impl LaunchConfig {
    fn default_suspend_on_start() -> bool {
        true
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::default(),
            godot_executable: None,
            extra_args: Vec::new(),
            suspend_on_start: Self::default_suspend_on_start(),
        }
    }
}

impl DebuggerConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.resolve_relative_paths(path.parent());
        Ok(config)
    }

    /// Parse TOML text. Unknown keys are logged and otherwise ignored.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let (config, unknown_keys) = Self::from_toml_str_with_unknown_keys(text)?;
        for key in unknown_keys {
            tracing::warn!(target: "sdb.config", key = %key, "ignoring unknown config key");
        }
        Ok(config)
    }

    /// Parse TOML text and report keys the schema does not recognize, as
    /// dotted paths such as `agent.prot`.
    pub fn from_toml_str_with_unknown_keys(text: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut unknown = Vec::new();
        let deserializer = toml::de::Deserializer::new(text);
        let config: Self = serde_ignored::deserialize(deserializer, |path| {
            unknown.push(path.to_string().trim_start_matches('.').to_owned());
        })?;
        unknown.sort();
        unknown.dedup();
        Ok((config, unknown))
    }

    /// A relative `godot_executable` is taken relative to the config file.
    fn resolve_relative_paths(&mut self, config_dir: Option<&Path>) {
        let Some(dir) = config_dir else {
            return;
        };
        if let Some(exe) = self.launch.godot_executable.as_mut() {
            // Bare names such as `godot` are left for a `PATH` lookup.
            if exe.is_relative() && exe.components().count() > 1 {
                *exe = dir.join(&*exe);
            }
        }
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        agent.socket_addr()?;
        if agent.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "agent.connect_timeout_ms must be greater than 0".to_owned(),
            ));
        }
        if agent.detach_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "agent.detach_timeout_ms must be greater than 0".to_owned(),
            ));
        }
        if !(MIN_PACKET_BYTES..=MAX_PACKET_BYTES_LIMIT).contains(&agent.max_packet_bytes) {
            return Err(ConfigError::Invalid(format!(
                "agent.max_packet_bytes must be between {MIN_PACKET_BYTES} and {MAX_PACKET_BYTES_LIMIT}"
            )));
        }
        if agent.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "agent.connect_attempts must be at least 1".to_owned(),
            ));
        }
        if agent.backoff_initial_ms > agent.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "agent.backoff_initial_ms must not exceed agent.backoff_max_ms".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Locate the config file for a Godot project directory.
pub fn discover_config_path(project_dir: &Path) -> Option<PathBuf> {
    [CONFIG_FILE_NAME, "godot-sdb.toml"]
        .into_iter()
        .map(|name| project_dir.join(name))
        .find(|path| path.is_file())
}

/// Load the configuration for a project directory.
///
/// If no config is present, returns [`DebuggerConfig::default`] and `None`.
pub fn load_for_project(
    project_dir: &Path,
) -> Result<(DebuggerConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(project_dir) else {
        return Ok((DebuggerConfig::default(), None));
    };
    let config = DebuggerConfig::load_from_path(&path)?;
    tracing::debug!(target: "sdb.config", path = %path.display(), "loaded project config");
    Ok((config, Some(path)))
}
