use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Shortest accepted pause between two probe cycles.
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Where the worker's stdout/stderr go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "path")]
pub enum OutputMode {
    /// Share the parent's streams (development runs).
    Inherit,
    /// Append both streams to a log file (packaged runs).
    LogFile(PathBuf),
}

/// Immutable settings for one supervisor.
///
/// Deserializable so the host can keep it next to its own settings; durations are
/// written in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub working_dir: Option<PathBuf>,
    pub executable: PathBuf,
    /// Arguments passed to the worker. `{host}` and `{port}` are substituted.
    pub args: Vec<String>,
    pub credential_env: String,
    pub port_env: String,
    pub extra_env: BTreeMap<String, String>,
    pub output: OutputMode,
    pub max_restarts: u32,
    #[serde(with = "millis")]
    pub restart_delay: Duration,
    #[serde(with = "millis")]
    pub restart_pause: Duration,
    #[serde(with = "millis")]
    pub spawn_grace: Duration,
    #[serde(with = "millis")]
    pub stop_grace: Duration,
    #[serde(with = "millis")]
    pub health_check_interval: Duration,
    #[serde(with = "millis")]
    pub health_check_timeout: Duration,
    pub max_health_check_failures: u32,
    /// Probed in order; the first 2xx answer wins.
    pub health_paths: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            working_dir: None,
            executable: PathBuf::from("backend"),
            args: vec![
                "--host".to_string(),
                "{host}".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            credential_env: "WORKER_AUTH_TOKEN".to_string(),
            port_env: "WORKER_PORT".to_string(),
            extra_env: BTreeMap::new(),
            output: OutputMode::Inherit,
            max_restarts: 5,
            restart_delay: Duration::from_secs(1),
            restart_pause: Duration::from_millis(500),
            spawn_grace: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(5),
            max_health_check_failures: 3,
            health_paths: vec![
                "/health".to_string(),
                "/api/health".to_string(),
                "/docs".to_string(),
            ],
        }
    }
}

impl SupervisorConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Worker arguments with the bind placeholders filled in.
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{host}", &self.host).replace("{port}", &port))
            .collect()
    }

    /// Full URLs of the health endpoints, in probing order.
    pub fn health_urls(&self) -> Vec<String> {
        let base = self.base_url();
        self.health_paths
            .iter()
            .map(|path| {
                if path.starts_with('/') {
                    format!("{base}{path}")
                } else {
                    format!("{base}/{path}")
                }
            })
            .collect()
    }

    /// Raises settings the supervisor cannot run with to their floor.
    pub(crate) fn normalized(mut self) -> Self {
        if self.health_check_interval < MIN_HEALTH_CHECK_INTERVAL {
            warn!(
                requested_ms = self.health_check_interval.as_millis() as u64,
                used_ms = MIN_HEALTH_CHECK_INTERVAL.as_millis() as u64,
                "health check interval too short, raising it"
            );
            self.health_check_interval = MIN_HEALTH_CHECK_INTERVAL;
        }
        self
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            host: self.host.clone(),
            port: self.port,
            max_restarts: self.max_restarts,
            restart_delay_ms: self.restart_delay.as_millis() as u64,
            health_check_interval_ms: self.health_check_interval.as_millis() as u64,
            health_check_timeout_ms: self.health_check_timeout.as_millis() as u64,
        }
    }
}

/// The subset of the configuration exposed to the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub host: String,
    pub port: u16,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
