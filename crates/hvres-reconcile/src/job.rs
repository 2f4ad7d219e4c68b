//! Job completion monitor.
//!
//! Modification methods answer 0 (done), 4096 (a job was started) or a
//! failure code. A started job is fetched once, then re-fetched every poll
//! interval until it leaves the Starting/Running states.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use hvres_bridge::{
    ManagementBridge, ManagementObject, MethodResult, ObjectPath, RETURN_COMPLETED,
    RETURN_JOB_STARTED,
};
use hvres_model::ServiceConfig;

use crate::error::{ReconcileError, ReconcileResult};

const JOB_STATE: &str = "JobState";
const ERROR_DESCRIPTION: &str = "ErrorDescription";

/// Lifecycle state of a host job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    Completed,
    /// Any other state. All of them are terminal.
    Other(u16),
}

impl JobState {
    pub fn from_code(code: u16) -> Self {
        match code {
            3 => JobState::Starting,
            4 => JobState::Running,
            7 => JobState::Completed,
            other => JobState::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            JobState::Starting => 3,
            JobState::Running => 4,
            JobState::Completed => 7,
            JobState::Other(code) => code,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Starting | JobState::Running)
    }
}

/// A successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    /// Re-fetches after the initial one. Zero when no job was started.
    pub polls: u32,
}

/// Resolves [`MethodResult`]s into success or a typed failure.
#[derive(Debug, Clone)]
pub struct JobMonitor {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl Default for JobMonitor {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl JobMonitor {
    /// `timeout = None` polls until the job reaches a terminal state.
    pub fn new(poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.poll_interval(), config.job_timeout())
    }

    /// Block until `result` is resolved.
    pub fn resolve<B: ManagementBridge + ?Sized>(
        &self,
        bridge: &B,
        result: MethodResult,
    ) -> ReconcileResult<JobOutcome> {
        match result.return_value {
            RETURN_COMPLETED => Ok(JobOutcome { polls: 0 }),
            RETURN_JOB_STARTED => {
                let path = result.job.ok_or_else(|| {
                    ReconcileError::Unexpected("job started without a job reference".into())
                })?;
                self.wait(bridge, &path)
            }
            code => {
                warn!(code, "modification rejected");
                Err(ReconcileError::SynchronousFailure { code })
            }
        }
    }

    fn wait<B: ManagementBridge + ?Sized>(
        &self,
        bridge: &B,
        path: &ObjectPath,
    ) -> ReconcileResult<JobOutcome> {
        let started = Instant::now();
        let mut job = fetch(bridge, path)?;
        let mut polls = 0;

        loop {
            let state = job_state(&job)?;
            if state.is_terminal() {
                if state == JobState::Completed {
                    info!(job = %path, polls, "job completed");
                    return Ok(JobOutcome { polls });
                }
                let description = job.get_str(ERROR_DESCRIPTION).unwrap_or_default().to_string();
                warn!(job = %path, state = state.code(), %description, "job failed");
                return Err(ReconcileError::JobFailed {
                    state: state.code(),
                    description,
                });
            }

            if let Some(limit) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    warn!(job = %path, ?elapsed, state = state.code(), "job timed out");
                    return Err(ReconcileError::JobTimedOut {
                        elapsed,
                        last_state: state.code(),
                    });
                }
            }

            std::thread::sleep(self.poll_interval);
            job = fetch(bridge, path)?;
            polls += 1;
            debug!(job = %path, polls, "job polled");
        }
    }
}

fn fetch<B: ManagementBridge + ?Sized>(
    bridge: &B,
    path: &ObjectPath,
) -> ReconcileResult<ManagementObject> {
    bridge
        .get_object(path)?
        .ok_or_else(|| ReconcileError::Unexpected(format!("job {path} disappeared")))
}

fn job_state(job: &ManagementObject) -> ReconcileResult<JobState> {
    job.get_u64(JOB_STATE)
        .and_then(|code| u16::try_from(code).ok())
        .map(JobState::from_code)
        .ok_or_else(|| ReconcileError::Unexpected(format!("job {} has no state", job.path)))
}
