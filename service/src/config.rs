//! Layered configuration loader.
//!
//! Three layers, later ones win:
//! 1. Defaults (hardcoded, see [`SupervisorConfig::default`])
//! 2. File config (`<config_home>/config.toml`)
//! 3. Environment overrides (`BOTHOST_*`)
//!
//! ## Example
//!
//! ```no_run
//! use bothost_service::config::ConfigLoader;
//! use std::path::PathBuf;
//!
//! let config = ConfigLoader::new()
//!     .with_config_home(PathBuf::from("/etc/bothost"))
//!     .load()
//!     .expect("Failed to load config");
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("I/O error loading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Config validation error: {0}")]
    Validation(String),

    #[error("Invalid value for ${var}: '{value}' (expected: {expected})")]
    InvalidEnvValue {
        var: String,
        value: String,
        expected: String,
    },
}

/// Supervisor-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Parent directory of every project root. Also holds `projects.json`.
    pub projects_dir: PathBuf,
    /// Parent directory of the per-project log files.
    pub logs_dir: PathBuf,
    /// Retained log window per project.
    pub max_log_lines: usize,
    /// Run command given to newly created projects.
    pub default_command: String,
    /// How long a fresh child must stay alive to count as started.
    #[serde(with = "millis")]
    pub start_grace: Duration,
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL.
    #[serde(with = "millis")]
    pub stop_timeout: Duration,
    /// CPU measurement window for usage samples.
    #[serde(with = "millis")]
    pub sample_interval: Duration,
    /// Control socket path. `None` means [`crate::default_socket_path`].
    pub socket_path: Option<PathBuf>,
    /// Operator log file. `None` logs to stderr.
    pub log_file: Option<PathBuf>,
    pub restart: RestartConfig,
    pub install: InstallConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("projects"),
            logs_dir: PathBuf::from("logs"),
            max_log_lines: 100,
            default_command: "python3 main.py".to_string(),
            start_grace: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
            sample_interval: Duration::from_millis(250),
            socket_path: None,
            log_file: None,
            restart: RestartConfig::default(),
            install: InstallConfig::default(),
        }
    }
}

/// Auto-restart settings. See [`crate::restart::RestartPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub enabled: bool,
    /// Consecutive automatic restarts before giving up.
    pub max_restarts: u32,
    /// Crashes sooner than this after start are treated as startup failures.
    /// `None` uses the start grace period.
    #[serde(with = "opt_millis")]
    pub min_uptime: Option<Duration>,
    #[serde(with = "millis")]
    pub backoff_base: Duration,
    #[serde(with = "millis")]
    pub backoff_max: Duration,
    /// A run at least this long resets the consecutive restart count.
    #[serde(with = "millis")]
    pub stable_after: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
            min_uptime: None,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            stable_after: Duration::from_secs(300),
        }
    }
}

/// Dependency installation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub command: String,
    /// File that must exist in the project root before installing.
    pub manifest: String,
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: "python3 -m pip install -r requirements.txt".to_string(),
            manifest: "requirements.txt".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl SupervisorConfig {
    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.max_log_lines == 0 {
            return Err(ConfigLoadError::Validation(
                "max_log_lines must be at least 1".to_string(),
            ));
        }
        if crate::project::tokenize_command(&self.default_command).is_err() {
            return Err(ConfigLoadError::Validation(format!(
                "default_command is not a valid command: {:?}",
                self.default_command
            )));
        }
        if crate::project::tokenize_command(&self.install.command).is_err() {
            return Err(ConfigLoadError::Validation(format!(
                "install.command is not a valid command: {:?}",
                self.install.command
            )));
        }
        if self.restart.backoff_max < self.restart.backoff_base {
            return Err(ConfigLoadError::Validation(
                "restart.backoff_max must not be smaller than restart.backoff_base".to_string(),
            ));
        }
        Ok(())
    }

    /// The socket path to listen on or connect to.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::default_socket_path)
    }
}

/// Builder for layered configuration loading.
pub struct ConfigLoader {
    config_home: Option<PathBuf>,
    env_prefix: String,
    skip_file: bool,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_home: None,
            env_prefix: "BOTHOST".to_string(),
            skip_file: false,
            skip_env: false,
        }
    }

    /// Directory holding `config.toml`.
    ///
    /// If not set, resolved from `$BOTHOST_HOME`, then `<config_dir>/bothost`.
    pub fn with_config_home(mut self, path: PathBuf) -> Self {
        self.config_home = Some(path);
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn skip_file_layer(mut self) -> Self {
        self.skip_file = true;
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load configuration with all enabled layers, then validate it.
    pub fn load(self) -> Result<SupervisorConfig, ConfigLoadError> {
        let mut config = if self.skip_file {
            SupervisorConfig::default()
        } else {
            let home = self.resolve_config_home()?;
            Self::load_from_file(&home)?
        };

        if !self.skip_env {
            Self::apply_env_overrides(&mut config, &self.env_prefix)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn resolve_config_home(&self) -> Result<PathBuf, ConfigLoadError> {
        if let Some(ref path) = self.config_home {
            return Ok(path.clone());
        }

        if let Ok(path) = env::var(format!("{}_HOME", self.env_prefix)) {
            return Ok(PathBuf::from(path));
        }

        dirs::config_dir()
            .map(|dir| dir.join("bothost"))
            .ok_or_else(|| {
                ConfigLoadError::Validation("Cannot determine config directory".to_string())
            })
    }

    /// Read `config.toml` from `config_home`.
    ///
    /// A missing file is not an error; defaults are returned. Keys absent
    /// from the file keep their default values.
    pub fn load_from_file(config_home: &Path) -> Result<SupervisorConfig, ConfigLoadError> {
        let config_path = config_home.join("config.toml");

        let contents = match std::fs::read_to_string(&config_path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("config.toml not found at {config_path:?}, using defaults");
                return Ok(SupervisorConfig::default());
            }
            Err(e) => return Err(ConfigLoadError::Io(e)),
        };

        Ok(toml::from_str(&contents)?)
    }

    /// Apply `<PREFIX>_*` environment overrides on top of `config`.
    pub fn apply_env_overrides(
        config: &mut SupervisorConfig,
        prefix: &str,
    ) -> Result<(), ConfigLoadError> {
        if let Some(value) = env_value(prefix, "PROJECTS_DIR") {
            config.projects_dir = PathBuf::from(value);
        }
        if let Some(value) = env_value(prefix, "LOGS_DIR") {
            config.logs_dir = PathBuf::from(value);
        }
        if let Some(value) = env_value(prefix, "SOCKET") {
            config.socket_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env_value(prefix, "LOG_FILE") {
            config.log_file = Some(PathBuf::from(value));
        }
        if let Some(value) = env_value(prefix, "MAX_LOG_LINES") {
            config.max_log_lines = parse_env(prefix, "MAX_LOG_LINES", &value, "a positive integer")?;
        }
        if let Some(value) = env_value(prefix, "START_GRACE_MS") {
            let ms: u64 = parse_env(prefix, "START_GRACE_MS", &value, "milliseconds")?;
            config.start_grace = Duration::from_millis(ms);
        }
        if let Some(value) = env_value(prefix, "STOP_TIMEOUT_MS") {
            let ms: u64 = parse_env(prefix, "STOP_TIMEOUT_MS", &value, "milliseconds")?;
            config.stop_timeout = Duration::from_millis(ms);
        }

        let restart_var = format!("{prefix}_AUTO_RESTART");
        if let Ok(value) = env::var(&restart_var) {
            match value.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::debug!("Applying env override: {restart_var}=true");
                    config.restart.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::debug!("Applying env override: {restart_var}=false");
                    config.restart.enabled = false;
                }
                _ => {
                    return Err(ConfigLoadError::InvalidEnvValue {
                        var: restart_var,
                        value,
                        expected: "true/false, 1/0, yes/no, on/off".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_value(prefix: &str, key: &str) -> Option<String> {
    let var = format!("{prefix}_{key}");
    match env::var(&var) {
        Ok(value) if !value.trim().is_empty() => {
            tracing::debug!("Applying env override: {var}={value}");
            Some(value)
        }
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(
    prefix: &str,
    key: &str,
    value: &str,
    expected: &str,
) -> Result<T, ConfigLoadError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigLoadError::InvalidEnvValue {
            var: format!("{prefix}_{key}"),
            value: value.to_string(),
            expected: expected.to_string(),
        })
}

/// Durations are written as integer milliseconds in `config.toml`.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
