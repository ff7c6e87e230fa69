use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

use crate::{
    config::{ConfigSnapshot, SupervisorConfig},
    credential::Credential,
    events::EventBus,
    supervisor::SupervisorStatus,
};

/// How often [`SupervisorHandle::wait_for_healthy`] looks at the status.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorHandleError {
    #[error("failed to send message to supervisor: {0}")]
    SendError(String),
    #[error("supervisor dropped the request before answering")]
    RecvError(#[from] oneshot::error::RecvError),
}

/// Commands sent by handles to the supervisor task.
#[derive(Debug)]
pub(crate) enum SupervisorMessage {
    Start(oneshot::Sender<bool>),
    Stop(oneshot::Sender<bool>),
    Restart(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<bool>),
}

/// Cheap, cloneable control surface of a running [`Supervisor`](crate::Supervisor).
///
/// Commands are queued to the supervisor task and answered in order. Status reads
/// are served from the last published snapshot and never wait on the queue.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMessage>,
    status_rx: watch::Receiver<SupervisorStatus>,
    config: Arc<SupervisorConfig>,
    events: Arc<EventBus>,
}

impl SupervisorHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<SupervisorMessage>,
        status_rx: watch::Receiver<SupervisorStatus>,
        config: Arc<SupervisorConfig>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            tx,
            status_rx,
            config,
            events,
        }
    }

    /// Starts the worker. Returns `true` once it is running, or if it already was.
    pub async fn start(&self) -> Result<bool, SupervisorHandleError> {
        self.request(SupervisorMessage::Start).await
    }

    /// Stops the worker. Best-effort: always ends in `Stopped`.
    pub async fn stop(&self) -> Result<bool, SupervisorHandleError> {
        self.request(SupervisorMessage::Stop).await
    }

    /// Stops the worker, pauses briefly and starts a fresh generation.
    pub async fn restart(&self) -> Result<bool, SupervisorHandleError> {
        self.request(SupervisorMessage::Restart).await
    }

    /// Stops the worker for good; later `start`/`restart` calls return `false`.
    pub async fn shutdown(&self) -> Result<bool, SupervisorHandleError> {
        self.request(SupervisorMessage::Shutdown).await
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status_rx.borrow().clone()
    }

    pub fn config(&self) -> ConfigSnapshot {
        self.config.snapshot()
    }

    /// The credential of the live worker, if any.
    pub fn credential(&self) -> Option<Credential> {
        self.status_rx.borrow().credential.clone()
    }

    pub fn base_url(&self) -> String {
        self.config.base_url()
    }

    /// Subscribe to or unsubscribe from the supervisor's event streams.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Polls until the worker is running with no outstanding health failures.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_for_healthy(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.status_rx.borrow().is_healthy {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn request(
        &self,
        message: impl FnOnce(oneshot::Sender<bool>) -> SupervisorMessage,
    ) -> Result<bool, SupervisorHandleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(message(reply_tx))
            .map_err(|e| SupervisorHandleError::SendError(e.to_string()))?;
        Ok(reply_rx.await?)
    }
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("status", &self.status_rx.borrow().status)
            .field("base_url", &self.config.base_url())
            .finish()
    }
}
