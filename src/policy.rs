//! Restart decisions.
//!
//! [`decide`] is a pure function of the restart history. It never touches the
//! supervisor state; the caller stores the returned attempt number.

use std::time::Duration;

/// Upper bound for any crash-triggered delay.
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

/// Growth factor applied per consecutive crash.
const BACKOFF_FACTOR: f64 = 1.5;

/// What caused the supervisor to consider a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTrigger {
    /// A running worker exited without being asked to.
    Crash,
    /// The OS could not create the worker process at all.
    SpawnError,
    /// Consecutive probe failures crossed the configured threshold.
    HealthFailure,
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; `attempt` is the new restart count.
    Attempt { attempt: u32, delay: Duration },
    /// The budget is spent. Nothing is scheduled until an explicit start.
    Exhausted,
}

/// Decides whether a restart should be scheduled and after which delay.
///
/// Crashes back off as `base × 1.5^(attempt − 1)`, capped at [`MAX_RESTART_DELAY`].
/// Spawn errors retry at a steady `base` cadence. Health failures go through the
/// restart path right away. All triggers draw from the same budget.
pub fn decide(
    restart_count: u32,
    max_restarts: u32,
    base_delay: Duration,
    trigger: RestartTrigger,
) -> RestartDecision {
    if restart_count >= max_restarts {
        return RestartDecision::Exhausted;
    }
    let attempt = restart_count + 1;
    let delay = match trigger {
        RestartTrigger::Crash => crash_delay(attempt, base_delay),
        RestartTrigger::SpawnError => base_delay,
        RestartTrigger::HealthFailure => Duration::ZERO,
    };
    RestartDecision::Attempt { attempt, delay }
}

/// Backoff for the `attempt`-th consecutive crash (1-based).
pub fn crash_delay(attempt: u32, base_delay: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let cap_ms = MAX_RESTART_DELAY.as_millis() as f64;
    let delay_ms = base_delay.as_millis() as f64 * BACKOFF_FACTOR.powi(exponent);
    if !delay_ms.is_finite() || delay_ms >= cap_ms {
        return MAX_RESTART_DELAY;
    }
    Duration::from_millis(delay_ms as u64)
}
