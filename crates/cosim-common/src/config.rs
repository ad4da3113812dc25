//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Shared primitives and utilities for the simulation manager."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5555))
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_process_exit_grace() -> Duration {
    Duration::from_secs(1)
}

fn default_interpreter() -> String {
    "python3".to_owned()
}

fn default_time_resolution() -> f64 {
    1.0
}

fn default_cache() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_log_to_file() -> bool {
    true
}

/// Primary configuration object for the simulation manager.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimManagerConfig {
    /// Address the manager listens on for spawned simulators to connect back.
    #[serde(default = "default_listen_addr")]
    pub addr: SocketAddr,
    /// Upper bound for connecting to a simulator and for its `init` reply.
    #[serde(default = "default_start_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub start_timeout: Duration,
    /// Upper bound for a remote simulator to acknowledge `stop`.
    #[serde(default = "default_stop_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub stop_timeout: Duration,
    /// How long an owned child process may take to exit before and after termination.
    #[serde(default = "default_process_exit_grace")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub process_exit_grace: Duration,
    /// Interpreter substituted for the `%(python)s` placeholder of spawn commands.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Seconds of simulated time represented by one integer time step.
    #[serde(default = "default_time_resolution")]
    pub time_resolution: f64,
    /// Keep per-step simulator output around for mid-step `get_data` requests.
    #[serde(default = "default_cache")]
    pub cache: bool,
    /// Simulated time at which the run ends; events at or after it are discarded.
    #[serde(default)]
    pub until: Option<i64>,
    /// Wall-clock pacing factor. Real-time mode (and with it `set_event`) is
    /// only available when set.
    #[serde(default)]
    pub rt_factor: Option<f64>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Simulator start entries keyed by simulator name.
    #[serde(default)]
    pub sims: IndexMap<String, SimConfigEntry>,
}

/// Metadata describing where a [`SimManagerConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SimManagerConfig,
    pub source: PathBuf,
}

impl SimManagerConfig {
    pub const ENV_CONFIG_PATH: &str = "COSIM_CONFIG";

    /// Load configuration from disk, respecting the `COSIM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
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

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<SimManagerConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve the start entry of a simulator by name.
    pub fn sim(&self, sim_name: &str) -> Option<&SimConfigEntry> {
        self.sims.get(sim_name)
    }

    /// Register a start entry, replacing an existing one with the same name.
    pub fn with_sim(mut self, sim_name: impl Into<String>, entry: SimConfigEntry) -> Self {
        self.sims.insert(sim_name.into(), entry);
        self
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if !(self.time_resolution > 0.0) {
            return Err(anyhow!(
                "time_resolution must be positive, got {}",
                self.time_resolution
            ));
        }
        if matches!(self.rt_factor, Some(factor) if !(factor > 0.0)) {
            return Err(anyhow!("rt_factor must be positive when set"));
        }
        if self.start_timeout.is_zero() {
            return Err(anyhow!("start_timeout must be greater than zero"));
        }
        for (sim_name, entry) in &self.sims {
            entry.validate(sim_name)?;
        }
        Ok(())
    }
}

impl Default for SimManagerConfig {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            start_timeout: default_start_timeout(),
            stop_timeout: default_stop_timeout(),
            process_exit_grace: default_process_exit_grace(),
            interpreter: default_interpreter(),
            time_resolution: default_time_resolution(),
            cache: default_cache(),
            until: None,
            rt_factor: None,
            logging: LoggingConfig::default(),
            sims: IndexMap::new(),
        }
    }
}

impl std::str::FromStr for SimManagerConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: SimManagerConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// How a single simulator is brought up.
///
/// The well-known kinds are `python` (an in-process factory reference of the
/// form `namespace:Name`), `cmd` (a command template spawned as a child
/// process, with optional `cwd` and `env`) and `connect` (`host:port` of an
/// already running simulator). Additional keys are kept in `extra` so custom
/// starters can pick them up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfigEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl SimConfigEntry {
    /// Entry for a simulator instantiated in-process from a registered factory.
    pub fn python(reference: impl Into<String>) -> Self {
        Self {
            python: Some(reference.into()),
            ..Self::default()
        }
    }

    /// Entry for a simulator spawned as a child process.
    pub fn cmd(command: impl Into<String>) -> Self {
        Self {
            cmd: Some(command.into()),
            ..Self::default()
        }
    }

    /// Entry for an already running simulator reachable at `host:port`.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self {
            connect: Some(addr.into()),
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Whether the entry carries the given start kind.
    pub fn has_kind(&self, kind: &str) -> bool {
        match kind {
            "python" => self.python.is_some(),
            "cmd" => self.cmd.is_some(),
            "connect" => self.connect.is_some(),
            other => self.extra.contains_key(other),
        }
    }

    fn validate(&self, sim_name: &str) -> Result<()> {
        if matches!(self.cmd.as_deref(), Some(cmd) if cmd.trim().is_empty()) {
            return Err(anyhow!("simulator '{}' declares an empty cmd", sim_name));
        }
        if matches!(self.connect.as_deref(), Some(addr) if addr.trim().is_empty()) {
            return Err(anyhow!(
                "simulator '{}' declares an empty connect address",
                sim_name
            ));
        }
        Ok(())
    }
}

/// Where and how the manager writes its trace output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory of the rolling log file.
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// File name prefix; defaults to `cosim`.
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Write the rolling JSON file next to console output.
    #[serde(default = "default_log_to_file")]
    pub file: bool,
    /// Filter used when neither `COSIM_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file: default_log_to_file(),
            filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
addr = "127.0.0.1:6000"
start_timeout = 2.5
stop_timeout = 1
until = 86400
rt_factor = 0.5

[sims.Csv]
python = "builtin:CsvPlayer"

[sims.Grid]
cmd = "%(python)s grid.py %(addr)s"
cwd = "models"
env = { GRID_MODE = "fast" }

[sims.Remote]
connect = "10.0.0.4:5678"

[sims.Docker]
docker = "registry/sim:latest"
"#;

    #[test]
    fn parses_sim_entries_and_timeouts() {
        let config: SimManagerConfig = SAMPLE.parse().expect("valid config");
        assert_eq!(config.addr, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.start_timeout, Duration::from_millis(2500));
        assert_eq!(config.stop_timeout, Duration::from_secs(1));
        assert_eq!(config.process_exit_grace, Duration::from_secs(1));
        assert_eq!(config.until, Some(86_400));
        assert_eq!(config.rt_factor, Some(0.5));

        let csv = config.sim("Csv").expect("csv entry");
        assert!(csv.has_kind("python"));
        assert!(!csv.has_kind("cmd"));

        let grid = config.sim("Grid").expect("grid entry");
        assert_eq!(grid.cwd.as_deref(), Some(Path::new("models")));
        assert_eq!(grid.env.get("GRID_MODE").map(String::as_str), Some("fast"));

        let docker = config.sim("Docker").expect("docker entry");
        assert!(docker.has_kind("docker"));
        assert_eq!(
            docker.extra.get("docker"),
            Some(&serde_json::json!("registry/sim:latest"))
        );
    }

    #[test]
    fn rejects_non_positive_time_resolution() {
        let err = "time_resolution = 0.0"
            .parse::<SimManagerConfig>()
            .expect_err("zero resolution rejected");
        assert!(err.to_string().contains("time_resolution"));
    }

    #[test]
    fn rejects_empty_connect_address() {
        let config = SimManagerConfig::default().with_sim("Broken", SimConfigEntry::connect(" "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn logging_block_overrides_defaults() {
        let config: SimManagerConfig = r#"
[logging]
format = "compact"
file = false
filter = "cosim_core=debug"
"#
        .parse()
        .expect("valid logging block");
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(!config.logging.file);
        assert_eq!(config.logging.filter.as_deref(), Some("cosim_core=debug"));

        let defaults = SimManagerConfig::default().logging;
        assert!(defaults.file);
        assert_eq!(defaults.format, LogFormat::Pretty);
    }

    #[test]
    fn loads_from_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cosim.toml");
        std::fs::write(&path, SAMPLE).expect("write config");
        let missing = dir.path().join("missing.toml");

        let loaded = SimManagerConfig::load_with_source(&[missing, path.clone()])
            .expect("config loads");
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.sims.len(), 4);
    }
}
