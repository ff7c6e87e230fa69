//! Liveness probing of the worker over HTTP.
//!
//! A probe cycle walks the configured endpoints in order and stops at the first
//! one answering 2xx within the per-request timeout. The monitor runs one cycle
//! per interval and never overlaps cycles.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::supervisor::InternalMessage;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Issues a single GET and reports the HTTP status code.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn get(&self, url: &str) -> Result<u16, ProbeError>;
}

/// [`HealthProbe`] backed by a shared `reqwest` client.
///
/// The worker always listens on a local address, so the client ignores any
/// system proxy configuration.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Result<reqwest::Client, String>,
}

impl HttpProbe {
    pub fn try_new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client: Ok(client) })
    }

    /// Like [`HttpProbe::try_new`], but a client that cannot be built is logged
    /// once and every later probe fails with the build error.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::try_new().unwrap_or_else(|e| {
            error!(error = %e, "cannot build health check client, every probe will fail");
            Self {
                client: Err(e.to_string()),
            }
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn get(&self, url: &str) -> Result<u16, ProbeError> {
        let client = self
            .client
            .as_ref()
            .map_err(|e| ProbeError::Other(e.clone()))?;
        let response = client.get(url).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Result of one probe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// `endpoint` answered 2xx.
    Healthy { endpoint: String },
    /// Every endpoint failed, errored or timed out.
    Unhealthy,
    /// The cycle itself could not run to completion.
    Fault(String),
}

/// Runs one probe cycle against `urls`, in order.
pub async fn probe_cycle(probe: &dyn HealthProbe, urls: &[String], timeout: Duration) -> ProbeOutcome {
    for url in urls {
        match tokio::time::timeout(timeout, probe.get(url)).await {
            Ok(Ok(status)) if (200..300).contains(&status) => {
                return ProbeOutcome::Healthy {
                    endpoint: url.clone(),
                };
            }
            Ok(Ok(status)) => debug!(endpoint = %url, status, "health endpoint answered non-2xx"),
            Ok(Err(e)) => debug!(endpoint = %url, error = %e, "health endpoint unreachable"),
            Err(_) => debug!(endpoint = %url, timeout_ms = timeout.as_millis() as u64, "health endpoint timed out"),
        }
    }
    ProbeOutcome::Unhealthy
}

/// Settings for one armed monitor.
pub(crate) struct MonitorSettings {
    pub(crate) probe: Arc<dyn HealthProbe>,
    pub(crate) urls: Arc<[String]>,
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) epoch: u64,
}

/// Probes on every interval tick until `token` is cancelled or the supervisor is gone.
///
/// Each cycle runs in its own task so a panicking probe is reported as a
/// [`ProbeOutcome::Fault`] instead of killing the monitor.
pub(crate) async fn monitor(
    settings: MonitorSettings,
    tx: mpsc::UnboundedSender<InternalMessage>,
    token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let probe = settings.probe.clone();
        let urls = settings.urls.clone();
        let timeout = settings.timeout;
        let mut cycle =
            tokio::spawn(async move { probe_cycle(probe.as_ref(), &urls, timeout).await });

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                cycle.abort();
                break;
            }
            joined = &mut cycle => match joined {
                Ok(outcome) => outcome,
                Err(e) => ProbeOutcome::Fault(e.to_string()),
            },
        };

        let report = InternalMessage::HealthReport {
            epoch: settings.epoch,
            outcome,
        };
        if tx.send(report).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Scripted {
        answers: Vec<(&'static str, Result<u16, &'static str>)>,
        calls: Mutex<Vec<String>>,
        hang_on: Option<&'static str>,
    }

    #[async_trait]
    impl HealthProbe for Scripted {
        async fn get(&self, url: &str) -> Result<u16, ProbeError> {
            self.calls.lock().unwrap().push(url.to_string());
            if self.hang_on == Some(url) {
                std::future::pending::<()>().await;
            }
            let (_, answer) = *self
                .answers
                .iter()
                .find(|(candidate, _)| *candidate == url)
                .expect("unscripted url");
            answer.map_err(|e| ProbeError::Other(e.to_string()))
        }
    }

    fn urls() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let probe = Scripted {
            answers: vec![("a", Ok(503)), ("b", Ok(204)), ("c", Ok(200))],
            calls: Mutex::new(Vec::new()),
            hang_on: None,
        };

        let outcome = probe_cycle(&probe, &urls(), Duration::from_secs(1)).await;

        assert_eq!(
            outcome,
            ProbeOutcome::Healthy {
                endpoint: "b".into()
            }
        );
        assert_eq!(*probe.calls.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn all_failures_are_unhealthy() {
        let probe = Scripted {
            answers: vec![("a", Err("refused")), ("b", Ok(404)), ("c", Ok(500))],
            calls: Mutex::new(Vec::new()),
            hang_on: None,
        };

        let outcome = probe_cycle(&probe, &urls(), Duration::from_secs(1)).await;

        assert_eq!(outcome, ProbeOutcome::Unhealthy);
        assert_eq!(probe.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_and_falls_through() {
        tokio::time::pause();
        let probe = Scripted {
            answers: vec![("b", Ok(500)), ("c", Ok(200))],
            calls: Mutex::new(Vec::new()),
            hang_on: Some("a"),
        };

        let outcome = probe_cycle(&probe, &urls(), Duration::from_millis(50)).await;

        assert_eq!(
            outcome,
            ProbeOutcome::Healthy {
                endpoint: "c".into()
            }
        );
    }
}
