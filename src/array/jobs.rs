//! Job Poller
//!
//! Drives asynchronous remote operations to a terminal state. Every invoked
//! method funnels through [`JobPoller::complete`]: a job handle is polled
//! until it finishes, a synchronous non-zero return code is a failure.
//!
//! Polling parameters are passed in explicitly through [`PollConfig`]; no
//! state is shared between calls apart from the metrics sink.

use crate::domain::classes::{assoc, job_state, rc, sync_state};
use crate::domain::model::{Instance, InstanceName, InvokeOutcome};
use crate::domain::ports::ManagementClientRef;
use crate::error::{Error, Result};
use crate::metrics::{DriverMetrics, Outcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between two fetches
    pub interval: Duration,
    /// Deadline after which the outcome is reported unknown
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Job Status
// =============================================================================

/// Interpretation of a job's `JobState`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed { code: u32, description: String },
}

impl JobStatus {
    pub fn from_instance(job: &Instance) -> Self {
        let state = job.u64_prop("JobState").unwrap_or(job_state::NEW);
        let code = job
            .u64_prop("ErrorCode")
            .map(|c| u32::try_from(c).unwrap_or(u32::MAX))
            .unwrap_or(0);
        let description = || {
            job.attr("ErrorDescription")
                .map(str::to_string)
                .unwrap_or_else(|| format!("job ended in state {}", state))
        };

        match state {
            job_state::COMPLETED if code == 0 => JobStatus::Succeeded,
            job_state::COMPLETED => JobStatus::Failed {
                code,
                description: description(),
            },
            job_state::TERMINATED..=job_state::SERVICE => JobStatus::Failed {
                code: if code == 0 {
                    u32::try_from(state).unwrap_or(u32::MAX)
                } else {
                    code
                },
                description: description(),
            },
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

// =============================================================================
// Job Poller
// =============================================================================

/// Polls remote jobs to completion
pub struct JobPoller {
    client: ManagementClientRef,
    config: PollConfig,
    metrics: Arc<DriverMetrics>,
}

impl JobPoller {
    pub fn new(client: ManagementClientRef, config: PollConfig, metrics: Arc<DriverMetrics>) -> Self {
        Self {
            client,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Settle the result of an invoked method
    ///
    /// Returns the outcome so callers can read output arguments once the
    /// operation has taken effect.
    pub async fn complete(&self, operation: &str, outcome: InvokeOutcome) -> Result<InvokeOutcome> {
        if let Some(job) = outcome.job() {
            self.await_completion(operation, job).await?;
            return Ok(outcome);
        }
        if outcome.return_code != rc::OK {
            let description = outcome
                .output("Description")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} returned {}", operation, outcome.return_code));
            return Err(Error::BackendOperationFailed {
                operation: operation.to_string(),
                code: outcome.return_code,
                description,
            });
        }
        Ok(outcome)
    }

    /// Poll a job until it reaches a terminal state or the deadline passes
    pub async fn await_completion(&self, operation: &str, job: &InstanceName) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;

        loop {
            self.metrics.record_poll();
            let instance = match self.client.get_instance(job).await {
                Ok(instance) => instance,
                Err(e) if e.is_not_found() => {
                    warn!("Job {} for {} disappeared while pending", job, operation);
                    self.metrics.record_job(Outcome::Vanished, started.elapsed());
                    return Err(Error::JobNotFound {
                        job: job.to_string(),
                    });
                }
                Err(e) => return Err(e),
            };

            match JobStatus::from_instance(&instance) {
                JobStatus::Succeeded => {
                    debug!("Job {} for {} completed", job, operation);
                    self.metrics.record_job(Outcome::Success, started.elapsed());
                    return Ok(());
                }
                JobStatus::Failed { code, description } => {
                    warn!(
                        "Job {} for {} failed with code {}: {}",
                        job, operation, code, description
                    );
                    self.metrics.record_job(Outcome::Failure, started.elapsed());
                    return Err(Error::BackendOperationFailed {
                        operation: operation.to_string(),
                        code,
                        description,
                    });
                }
                JobStatus::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                warn!("Gave up on job {} for {} after {:?}", job, operation, waited);
                self.metrics.record_job(Outcome::Timeout, waited);
                return Err(Error::Timeout {
                    job: job.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(self.config.interval.min(deadline - now)).await;
        }
    }

    /// Elements a finished job acted upon
    pub async fn affected_elements(&self, job: &InstanceName) -> Result<Vec<InstanceName>> {
        self.client
            .associator_names(job, Some(assoc::AFFECTED_JOB_ELEMENT), None)
            .await
    }
}

// =============================================================================
// Replica Synchronization
// =============================================================================

/// State a replica synchronization is awaited to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    /// Copy progress reached at least this percentage
    Percent(u8),
    /// Relationship removed or broken
    Detached,
}

/// Waits for replica synchronizations, with the job poller's deadline policy
pub struct SyncWaiter {
    client: ManagementClientRef,
    config: PollConfig,
}

impl SyncWaiter {
    pub fn new(client: ManagementClientRef, config: PollConfig) -> Self {
        Self { client, config }
    }

    pub async fn wait(&self, sync: &InstanceName, target: SyncTarget) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;

        loop {
            let instance = match self.client.get_instance(sync).await {
                Ok(instance) => Some(instance),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };

            let state = instance.as_ref().and_then(|i| i.u64_prop("SyncState"));
            match (target, instance.as_ref()) {
                (SyncTarget::Detached, None) => return Ok(()),
                (SyncTarget::Detached, Some(_)) if state == Some(sync_state::BROKEN) => {
                    return Ok(())
                }
                (SyncTarget::Percent(_), None) => {
                    return Err(Error::ResourceNotFound {
                        kind: "replica synchronization".into(),
                        name: sync.to_string(),
                    })
                }
                (SyncTarget::Percent(_), Some(_)) if state == Some(sync_state::BROKEN) => {
                    return Err(Error::BackendOperationFailed {
                        operation: "CreateElementReplica".into(),
                        code: sync_state::BROKEN as u32,
                        description: format!("synchronization {} is broken", sync),
                    })
                }
                (SyncTarget::Percent(wanted), Some(instance)) => {
                    let done = instance.u64_prop("PercentSynced").unwrap_or(0);
                    debug!("Synchronization {} at {}%", sync, done);
                    if done >= u64::from(wanted) {
                        return Ok(());
                    }
                }
                (SyncTarget::Detached, Some(_)) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    job: sync.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.config.interval.min(deadline - now)).await;
        }
    }
}
