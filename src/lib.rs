//! # 🛟 worker-supervisor
//!
//! `worker-supervisor` keeps a local backend process alive for a desktop application.
//! It spawns the worker with a fresh shared secret, probes it over HTTP, and restarts
//! it with back-off when it crashes or stops answering.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use worker_supervisor::SupervisorBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = SupervisorBuilder::new()
//!         .with_executable("./backend")
//!         .with_port(8765)
//!         .build()
//!         .run();
//!
//!     handle.events().on_error(|fault| {
//!         eprintln!("backend trouble: {}", fault.kind());
//!         Ok(())
//!     });
//!
//!     handle.start().await?;
//!     if handle.wait_for_healthy(Duration::from_secs(30)).await {
//!         println!("backend ready at {}", handle.base_url());
//!     }
//!
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## What you get
//!
//! * **Credential rotation** – every spawn gets a new secret via the environment; it is
//!   never reused, persisted or logged.
//! * **Health probing** – an ordered list of HTTP endpoints, first 2xx wins, with a
//!   per-request timeout.
//! * **Automatic restarts** – crashes back off exponentially (capped at 30s), spawn
//!   errors retry at a steady cadence, health failures restart right away; all share
//!   one budget.
//! * **Events** – status, health, restart and error streams with isolated listeners.
//!
//! ## API overview
//!
//! | SupervisorHandle method        | Purpose                                                 |
//! | ------------------------------ | ------------------------------------------------------- |
//! | `start()` / `stop()`           | Launch or tear down the worker                          |
//! | `restart()`                    | Stop, pause, start with a fresh credential              |
//! | `shutdown()`                   | Final stop; refuses later starts                        |
//! | `status()`                     | `SupervisorStatus` snapshot                             |
//! | `config()`                     | `ConfigSnapshot` of the public settings                 |
//! | `credential()` / `base_url()`  | What the frontend needs to talk to the worker           |
//! | `wait_for_healthy(timeout)`    | Block until running with zero health failures           |
//! | `events()`                     | Subscribe/unsubscribe to the four event streams         |

pub use config::{ConfigSnapshot, OutputMode, SupervisorConfig, MIN_HEALTH_CHECK_INTERVAL};
pub use credential::Credential;
pub use events::{
    EventBus, FaultKind, HealthChange, RestartScheduled, StatusChange, SubscriptionId,
    SupervisorFault,
};
pub use health::{probe_cycle, HealthProbe, HttpProbe, ProbeError, ProbeOutcome};
pub use policy::{decide, RestartDecision, RestartTrigger, MAX_RESTART_DELAY};
pub use supervisor::{
    builder::SupervisorBuilder,
    handle::{SupervisorHandle, SupervisorHandleError},
    Supervisor, SupervisorStatus, WorkerStatus,
};
pub use worker::{
    LaunchError, LaunchRequest, Launcher, ProcessLauncher, SpawnedProcess, WorkerExit,
    WorkerProcess,
};

mod config;
mod credential;
mod events;
mod health;
mod policy;
mod supervisor;
mod worker;
