use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};

use crate::{
    config::{OutputMode, SupervisorConfig},
    events::EventBus,
    health::{HealthProbe, HttpProbe},
    supervisor::{SupervisorState, SupervisorStatus},
    worker::{Launcher, ProcessLauncher},
    Supervisor,
};

/// Builds a `Supervisor` instance with configurable parameters.
///
/// Starts from [`SupervisorConfig::default`]; every `with_*` call overrides one
/// setting. The real process launcher and HTTP probe are used unless replaced.
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn HealthProbe>,
}

impl SupervisorBuilder {
    /// Creates a new builder with default configuration values.
    pub fn new() -> Self {
        Self::from_config(SupervisorConfig::default())
    }

    /// Creates a builder around an existing configuration, e.g. one loaded from disk.
    pub fn from_config(config: SupervisorConfig) -> Self {
        Self {
            config,
            launcher: Arc::new(ProcessLauncher),
            probe: Arc::new(HttpProbe::new()),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the worker executable.
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.config.executable = executable.into();
        self
    }

    /// Sets the worker arguments. `{host}` and `{port}` are substituted at launch.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    /// Adds a variable to the worker environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.config.output = output;
        self
    }

    /// Sets the maximum number of automatic restarts before giving up.
    pub fn with_max_restart_attempts(mut self, attempts: u32) -> Self {
        self.config.max_restarts = attempts;
        self
    }

    /// Sets the base delay for restarts, used in exponential backoff.
    pub fn with_base_restart_delay(mut self, delay: Duration) -> Self {
        self.config.restart_delay = delay;
        self
    }

    /// Sets the pause between tearing a worker down and starting its replacement.
    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.config.restart_pause = pause;
        self
    }

    /// Sets how long a fresh worker must stay alive to count as started.
    pub fn with_spawn_grace(mut self, grace: Duration) -> Self {
        self.config.spawn_grace = grace;
        self
    }

    /// Sets how long a worker gets to exit after the termination signal.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Sets the interval between health checks. Values below
    /// [`MIN_HEALTH_CHECK_INTERVAL`](crate::MIN_HEALTH_CHECK_INTERVAL) are raised to it.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Sets the timeout of each individual health request.
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.config.health_check_timeout = timeout;
        self
    }

    pub fn with_max_health_check_failures(mut self, failures: u32) -> Self {
        self.config.max_health_check_failures = failures;
        self
    }

    /// Replaces the ordered list of health endpoint paths.
    pub fn with_health_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.health_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the process launcher.
    pub fn with_launcher(mut self, launcher: impl Launcher) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    /// Replaces the health probe.
    pub fn with_probe(mut self, probe: impl HealthProbe) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Constructs the `Supervisor` with the configured settings.
    pub fn build(self) -> Supervisor {
        let config = self.config.normalized();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SupervisorStatus::initial(&config));
        let health_urls = config.health_urls().into();
        Supervisor {
            config: Arc::new(config),
            health_urls,
            launcher: self.launcher,
            probe: self.probe,
            events: Arc::new(EventBus::new()),
            state: SupervisorState::new(),
            internal_tx,
            internal_rx,
            status_tx,
        }
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
