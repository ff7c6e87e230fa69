use std::{
    collections::{BTreeMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::watch;
use worker_supervisor::{
    FaultKind, HealthChange, HealthProbe, LaunchError, LaunchRequest, Launcher, ProbeError,
    RestartScheduled, StatusChange, SupervisorBuilder, SupervisorFault, SupervisorHandle,
    WorkerExit, WorkerProcess, WorkerStatus,
};

// Builder with short timings for paused-clock tests.
#[allow(unused)]
pub fn test_builder(launcher: &FakeLauncher, probe: &FakeProbe) -> SupervisorBuilder {
    SupervisorBuilder::new()
        .with_launcher(launcher.clone())
        .with_probe(probe.clone())
        .with_spawn_grace(Duration::from_millis(100))
        .with_stop_grace(Duration::from_millis(200))
        .with_restart_pause(Duration::from_millis(50))
        .with_base_restart_delay(Duration::from_millis(1000))
        .with_max_restart_attempts(2)
        .with_health_check_interval(Duration::from_secs(1))
        .with_health_check_timeout(Duration::from_millis(500))
        .with_max_health_check_failures(3)
}

#[allow(unused)]
#[derive(Debug, Clone, Copy)]
pub enum LaunchScript {
    Live,
    /// Live, but ignores the termination signal.
    Stubborn,
    SpawnError,
    ExitDuringGrace(i32),
}

#[derive(Clone)]
struct WorkerControl {
    exit_tx: Arc<watch::Sender<Option<WorkerExit>>>,
    killed: Arc<AtomicBool>,
}

impl WorkerControl {
    fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }
}

#[derive(Default)]
struct LauncherInner {
    script: Mutex<VecDeque<LaunchScript>>,
    requests: Mutex<Vec<BTreeMap<String, String>>>,
    workers: Mutex<Vec<WorkerControl>>,
}

/// Launcher handing out in-memory workers, scripted per launch.
/// Unscripted launches produce a live worker.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    inner: Arc<LauncherInner>,
}

#[allow(unused)]
impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(script: impl IntoIterator<Item = LaunchScript>) -> Self {
        let launcher = Self::default();
        launcher.inner.script.lock().unwrap().extend(script);
        launcher
    }

    /// Number of launch attempts, including failed ones.
    pub fn launch_count(&self) -> usize {
        self.inner.requests.lock().unwrap().len()
    }

    /// Number of workers created that have not exited.
    pub fn live_count(&self) -> usize {
        self.inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| !w.has_exited())
            .count()
    }

    pub fn env_of_launch(&self, index: usize) -> BTreeMap<String, String> {
        self.inner.requests.lock().unwrap()[index].clone()
    }

    /// Makes the most recent worker exit on its own.
    pub fn crash_latest(&self, code: i32) {
        let workers = self.inner.workers.lock().unwrap();
        let worker = workers.last().expect("no worker launched");
        worker.exit_tx.send_replace(Some(WorkerExit {
            code: Some(code),
            signal: None,
        }));
    }

    pub fn latest_was_killed(&self) -> bool {
        let workers = self.inner.workers.lock().unwrap();
        workers
            .last()
            .map(|w| w.killed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        self.inner.requests.lock().unwrap().push(request.env.clone());
        let script = self
            .inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(LaunchScript::Live);

        let stubborn = match script {
            LaunchScript::SpawnError => {
                return Err(LaunchError::Spawn(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no such file or directory",
                )));
            }
            LaunchScript::ExitDuringGrace(code) => {
                tokio::time::sleep(request.grace / 2).await;
                return Err(LaunchError::ExitedDuringGrace(WorkerExit {
                    code: Some(code),
                    signal: None,
                }));
            }
            LaunchScript::Live => false,
            LaunchScript::Stubborn => true,
        };

        tokio::time::sleep(request.grace).await;
        let (exit_tx, exit_rx) = watch::channel(None);
        let control = WorkerControl {
            exit_tx: Arc::new(exit_tx),
            killed: Arc::new(AtomicBool::new(false)),
        };
        self.inner.workers.lock().unwrap().push(control.clone());
        Ok(Box::new(FakeWorker {
            control,
            exit_rx,
            stubborn,
        }))
    }
}

struct FakeWorker {
    control: WorkerControl,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    stubborn: bool,
}

#[async_trait]
impl WorkerProcess for FakeWorker {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<WorkerExit> {
        loop {
            if let Some(exit) = *self.exit_rx.borrow_and_update() {
                return Ok(exit);
            }
            if self.exit_rx.changed().await.is_err() {
                return Err(io::Error::new(io::ErrorKind::Other, "worker vanished"));
            }
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        if !self.stubborn {
            self.control.exit_tx.send_replace(Some(WorkerExit {
                code: None,
                signal: Some(15),
            }));
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.control.killed.store(true, Ordering::SeqCst);
        self.control.exit_tx.send_replace(Some(WorkerExit {
            code: None,
            signal: Some(9),
        }));
        Ok(())
    }
}

#[allow(unused)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Healthy,
    Unhealthy,
    Panic,
    /// Hangs until [`FakeProbe::release`], then answers 503.
    Blocked,
}

/// Probe answering every endpoint according to a switchable mode.
#[derive(Clone)]
pub struct FakeProbe {
    mode: Arc<Mutex<ProbeMode>>,
    calls: Arc<AtomicUsize>,
    status: Arc<AtomicU16>,
    gate: Arc<watch::Sender<bool>>,
}

#[allow(unused)]
impl FakeProbe {
    pub fn new(mode: ProbeMode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            calls: Arc::new(AtomicUsize::new(0)),
            status: Arc::new(AtomicU16::new(503)),
            gate: Arc::new(watch::channel(false).0),
        }
    }

    /// Lets every blocked request answer.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn set(&self, mode: ProbeMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn get(&self, _url: &str) -> Result<u16, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            ProbeMode::Healthy => Ok(200),
            ProbeMode::Unhealthy => Ok(self.status.load(Ordering::SeqCst)),
            ProbeMode::Panic => panic!("health endpoint blew up"),
            ProbeMode::Blocked => {
                let mut open = self.gate.subscribe();
                let _ = open.wait_for(|open| *open).await;
                Ok(503)
            }
        }
    }
}

#[allow(unused)]
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Status(StatusChange),
    Health(HealthChange),
    Restart(RestartScheduled),
    Error(SupervisorFault),
}

/// Records every event of every stream, in delivery order.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Recorded>>>,
}

#[allow(unused)]
impl EventLog {
    pub fn attach(handle: &SupervisorHandle) -> Self {
        let log = Self::default();
        let bus = handle.events();
        let sink = log.events.clone();
        bus.on_status_change(move |e| {
            sink.lock().unwrap().push(Recorded::Status(*e));
            Ok(())
        });
        let sink = log.events.clone();
        bus.on_health_change(move |e| {
            sink.lock().unwrap().push(Recorded::Health(*e));
            Ok(())
        });
        let sink = log.events.clone();
        bus.on_restart(move |e| {
            sink.lock().unwrap().push(Recorded::Restart(*e));
            Ok(())
        });
        let sink = log.events.clone();
        bus.on_error(move |e| {
            sink.lock().unwrap().push(Recorded::Error(e.clone()));
            Ok(())
        });
        log
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn transitions(&self) -> Vec<(WorkerStatus, WorkerStatus)> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Status(change) => Some((change.from, change.to)),
                _ => None,
            })
            .collect()
    }

    pub fn restarts(&self) -> Vec<RestartScheduled> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Restart(restart) => Some(restart),
                _ => None,
            })
            .collect()
    }

    pub fn faults(&self) -> Vec<FaultKind> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Error(fault) => Some(fault.kind()),
                _ => None,
            })
            .collect()
    }

    pub fn health(&self) -> Vec<HealthChange> {
        self.all()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Health(change) => Some(change),
                _ => None,
            })
            .collect()
    }
}
