use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logrelay_types::{Endpoint, FailureClass, PollAttempt, PollOutcome};

use crate::policy::RetryPolicy;
use crate::probe::Probe;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("{endpoint} still unreachable after {attempts} attempts: {last_error}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{endpoint} still unreachable after {elapsed:?} ({attempts} attempts)")]
    DeadlineExceeded {
        endpoint: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("wait for {endpoint} cancelled after {attempts} attempts")]
    Cancelled { endpoint: String, attempts: u32 },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("no command given to hand off to")]
    EmptyCommand,

    #[error("failed to start `{program}`: {source}")]
    Handoff {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// What happened while the gate was waiting
///
/// Only the most recent failure is kept, so an unbounded wait holds a
/// constant amount of state.
#[derive(Clone, Debug)]
pub struct GateReport {
    /// Probes run, including the successful one
    pub attempts: u32,
    pub last_failure: Option<PollAttempt>,
    pub elapsed: Duration,
}

impl GateReport {
    pub fn failures(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Startup barrier: polls an endpoint until it answers
pub struct ReadinessGate {
    probe: Box<dyn Probe>,
    policy: RetryPolicy,

    /// Receives one line per failed attempt and one on success
    diagnostics: Box<dyn Write + Send>,

    cancel: CancellationToken,
}

impl ReadinessGate {
    pub fn new(probe: Box<dyn Probe>, policy: RetryPolicy) -> Self {
        Self {
            probe,
            policy,
            diagnostics: Box::new(std::io::stderr()),
            cancel: CancellationToken::new(),
        }
    }

    /// Send diagnostics somewhere other than stderr
    pub fn with_diagnostics(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.diagnostics = writer;
        self
    }

    /// Stop waiting when this token is cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Block until the endpoint is reachable or the policy gives up
    pub async fn wait(&mut self, endpoint: &Endpoint) -> Result<GateReport, GateError> {
        let started = Instant::now();
        let deadline = self.policy.deadline.map(|d| started + d);
        let mut attempt: u32 = 0;
        let mut last_failure: Option<PollAttempt> = None;
        let mut streaks: HashMap<FailureClass, u32> = HashMap::new();

        info!(endpoint = %endpoint, probe = endpoint.probe.label(), "Waiting for dependency");

        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(cancelled(endpoint, attempt - 1));
                }
                result = self.probe.probe(endpoint) => result,
            };

            let error = match result {
                Ok(()) => {
                    debug!(endpoint = %endpoint, attempt, "Dependency is ready");
                    let _ = writeln!(self.diagnostics, "{} is ready (attempt {})", endpoint, attempt);
                    return Ok(GateReport {
                        attempts: attempt,
                        last_failure,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) => e,
            };

            let class = error.class();
            // The diagnostics line is the user-facing report for each attempt
            debug!(endpoint = %endpoint, attempt, class = class.as_str(), error = %error, "Dependency not ready");
            let _ = writeln!(
                self.diagnostics,
                "{} is unavailable ({}) - attempt {}",
                endpoint, error, attempt
            );
            last_failure = Some(PollAttempt {
                attempt,
                at: Utc::now(),
                outcome: PollOutcome::Failure {
                    class,
                    message: error.to_string(),
                },
            });

            if !self.policy.allows_attempt(attempt) {
                return Err(GateError::Exhausted {
                    endpoint: endpoint.to_string(),
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            // A failure of one class ends the streaks of the others
            let streak = {
                let current = streaks.get(&class).copied().unwrap_or(0) + 1;
                streaks.clear();
                streaks.insert(class, current);
                current
            };
            let mut delay = self.policy.delay_for(class, streak);

            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(GateError::DeadlineExceeded {
                        endpoint: endpoint.to_string(),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                delay = delay.min(deadline - now);
            }

            debug!(?delay, "Sleeping before next probe");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(cancelled(endpoint, attempt));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn cancelled(endpoint: &Endpoint, attempts: u32) -> GateError {
    warn!(endpoint = %endpoint, attempts, "Wait cancelled");
    GateError::Cancelled {
        endpoint: endpoint.to_string(),
        attempts,
    }
}
