pub(crate) mod process;

use std::{collections::BTreeMap, io, path::PathBuf, process::ExitStatus, time::Duration};

use async_trait::async_trait;

use crate::config::OutputMode;

pub use process::{ProcessLauncher, SpawnedProcess};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Everything needed to start one worker generation.
///
/// Built fresh by the supervisor for every spawn; the launcher consumes it.
#[derive(Clone)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Includes the credential, so this type deliberately has no `Debug`.
    pub env: BTreeMap<String, String>,
    pub output: OutputMode,
    /// How long the process must stay alive before the launch counts as successful.
    pub grace: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker exited during startup grace period ({0})")]
    ExitedDuringGrace(WorkerExit),
}

/// A live worker owned by the supervisor.
///
/// Only the supervisor holds this; dropping it must not leave the process behind.
#[async_trait]
pub trait WorkerProcess: Send + 'static {
    fn id(&self) -> Option<u32>;

    /// Resolves once the process has exited. Must be cancel safe.
    async fn wait(&mut self) -> io::Result<WorkerExit>;

    /// Asks the process to shut down on its own.
    fn terminate(&mut self) -> io::Result<()>;

    /// Kills the process and reaps it.
    async fn kill(&mut self) -> io::Result<()>;
}

/// Starts worker processes.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Spawns the worker and waits out the grace period.
    ///
    /// Returns the live process only if it is still running once `request.grace`
    /// has elapsed.
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerProcess>, LaunchError>;
}
