use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{
    config::OutputMode,
    worker::{LaunchError, LaunchRequest, Launcher, WorkerExit, WorkerProcess},
};

/// Launches the worker as a child OS process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let mut command = Command::new(&request.executable);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        let (stdout, stderr) = output_streams(&request.output);
        command.stdout(stdout).stderr(stderr);

        let mut child = command.spawn().map_err(LaunchError::Spawn)?;
        debug!(
            pid = child.id(),
            executable = %request.executable.display(),
            "worker spawned, waiting out grace period"
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(LaunchError::Spawn)?;
                return Err(LaunchError::ExitedDuringGrace(status.into()));
            }
            _ = tokio::time::sleep(request.grace) => {}
        }
        Ok(Box::new(SpawnedProcess { child }))
    }
}

/// A worker started by [`ProcessLauncher`].
#[derive(Debug)]
pub struct SpawnedProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for SpawnedProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<WorkerExit> {
        self.child.wait().await.map(WorkerExit::from)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        send_sigterm(&self.child)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> io::Result<()> {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    // Already reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
}

fn output_streams(output: &OutputMode) -> (Stdio, Stdio) {
    match output {
        OutputMode::Inherit => (Stdio::inherit(), Stdio::inherit()),
        OutputMode::LogFile(path) => match open_log(path) {
            Ok((stdout, stderr)) => (stdout.into(), stderr.into()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open worker log file, inheriting output");
                (Stdio::inherit(), Stdio::inherit())
            }
        },
    }
}

fn open_log(path: &Path) -> io::Result<(File, File)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = OpenOptions::new().create(true).append(true).open(path)?;
    let stderr = stdout.try_clone()?;
    Ok((stdout, stderr))
}
