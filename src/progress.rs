use std::time::Duration;

use crate::domain::{JobHandle, JobStatus, MaterializeMode, TerminalStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Submitted {
        job: JobHandle,
    },
    Status {
        job: JobHandle,
        status: JobStatus,
        fetches: u32,
        elapsed: Duration,
    },
    Retrying {
        job: JobHandle,
        error: String,
        attempt: u32,
    },
    Finished {
        job: JobHandle,
        outcome: TerminalStatus,
        elapsed: Duration,
    },
    Resolved {
        job: JobHandle,
        url: String,
        filename: String,
    },
    Materialized {
        mode: MaterializeMode,
        location: Option<String>,
    },
}

impl ProgressEvent {
    pub fn message(&self) -> String {
        match self {
            ProgressEvent::Submitted { job } => format!("Job submitted: {job}"),
            ProgressEvent::Status { status, .. } => format!("Download status: {status}"),
            ProgressEvent::Retrying { error, attempt, .. } => {
                format!("Status check failed (attempt {attempt}): {error}")
            }
            ProgressEvent::Finished { outcome, elapsed, .. } => {
                format!("Job {outcome} after {}s", elapsed.as_secs())
            }
            ProgressEvent::Resolved { url, .. } => format!("The URL for download is: {url}"),
            ProgressEvent::Materialized { mode, location } => match location {
                Some(location) => format!("Dataset materialized ({mode}) at {location}"),
                None => format!("Dataset materialized ({mode})"),
            },
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}
