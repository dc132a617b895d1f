use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::cancel::CancellationToken;
use crate::domain::{Credential, JobHandle, JobStatus, TerminalStatus};
use crate::error::WekeoError;
use crate::progress::{ProgressEvent, ProgressSink};

/// Delay between two status checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(5))
    }
}

impl Backoff {
    /// Delay before the check following the `wait`-th wait (zero-based).
    pub fn delay(&self, wait: u32) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential {
                initial,
                factor,
                max,
            } => {
                let exponent = i32::try_from(wait).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * factor.max(1.0).powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub backoff: Backoff,
    /// Consecutive transient failures tolerated before giving up.
    pub max_transient_retries: u32,
    /// Upper bound on the whole poll, measured from the first check.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_transient_retries: 5,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollOutcome {
    pub status: TerminalStatus,
    pub fetches: u32,
    /// Checks that returned a status string outside the known set.
    pub unknown_observations: u32,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Drives one job to a terminal state. Holds no state between calls.
pub struct JobPoller<'a, C: BrokerClient> {
    client: &'a C,
    policy: PollPolicy,
}

impl<'a, C: BrokerClient> JobPoller<'a, C> {
    pub fn new(client: &'a C, policy: PollPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// One status request. Transport failures and 429/5xx replies come back
    /// as transient errors; a body without a string `status` is fatal.
    pub fn check(&self, job: &JobHandle, credential: &Credential) -> Result<JobStatus, WekeoError> {
        let reply = self.client.fetch_status(job, credential)?.check_auth()?;
        if !reply.is_success() {
            return Err(WekeoError::BrokerStatus {
                status: reply.status,
                message: reply.body,
            });
        }
        let status = reply
            .json()
            .ok()
            .and_then(|value| {
                value
                    .get("status")
                    .and_then(|status| status.as_str())
                    .map(JobStatus::parse)
            })
            .ok_or_else(|| WekeoError::MalformedStatus(reply.body.clone()))?;
        Ok(status)
    }

    pub fn poll(
        &self,
        job: &JobHandle,
        credential: &Credential,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<PollOutcome, WekeoError> {
        let started = Instant::now();
        // A limit past the clock's range means no deadline.
        let deadline = self
            .policy
            .deadline
            .and_then(|limit| started.checked_add(limit));
        let mut fetches = 0u32;
        let mut unknown_observations = 0u32;
        let mut transient_failures = 0u32;
        let mut waits = 0u32;

        let finish = |status: TerminalStatus,
                      fetches: u32,
                      unknown_observations: u32|
         -> Result<PollOutcome, WekeoError> {
            let elapsed = started.elapsed();
            info!(job = %job, %status, fetches, "poll finished");
            sink.event(ProgressEvent::Finished {
                job: job.clone(),
                outcome: status,
                elapsed,
            });
            Ok(PollOutcome {
                status,
                fetches,
                unknown_observations,
                elapsed,
            })
        };

        loop {
            if cancel.is_cancelled() {
                return finish(TerminalStatus::Cancelled, fetches, unknown_observations);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return finish(TerminalStatus::TimedOut, fetches, unknown_observations);
            }

            fetches += 1;
            match self.check(job, credential) {
                Ok(status) => {
                    transient_failures = 0;
                    if !status.is_terminal() {
                        sink.event(ProgressEvent::Status {
                            job: job.clone(),
                            status: status.clone(),
                            fetches,
                            elapsed: started.elapsed(),
                        });
                    }
                    match status {
                        JobStatus::Completed => {
                            return finish(TerminalStatus::Completed, fetches, unknown_observations);
                        }
                        JobStatus::Failed => {
                            return finish(TerminalStatus::Failed, fetches, unknown_observations);
                        }
                        JobStatus::Running => debug!(job = %job, fetches, "job running"),
                        JobStatus::Unknown(raw) => {
                            unknown_observations += 1;
                            warn!(job = %job, status = %raw, "unrecognized job status, will retry");
                        }
                    }
                }
                Err(err) if err.is_transient() => {
                    transient_failures += 1;
                    if transient_failures > self.policy.max_transient_retries {
                        return Err(WekeoError::PollTransport(err.to_string()));
                    }
                    warn!(job = %job, error = %err, attempt = transient_failures, "status check failed");
                    sink.event(ProgressEvent::Retrying {
                        job: job.clone(),
                        error: err.to_string(),
                        attempt: transient_failures,
                    });
                }
                Err(err) => return Err(err),
            }

            let mut delay = self.policy.backoff.delay(waits);
            waits += 1;
            if let Some(deadline) = deadline {
                delay = delay.min(deadline.saturating_duration_since(Instant::now()));
            }
            if cancel.wait_timeout(delay) {
                return finish(TerminalStatus::Cancelled, fetches, unknown_observations);
            }
        }
    }
}
