//! Driver Metrics
//!
//! Prometheus counters for remote job outcomes and driver operations.
//! Each [`DriverMetrics`] owns its registry so several drivers (and tests)
//! can live in one process without colliding in the global default registry.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Outcome label for a finished job or operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Vanished,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
            Outcome::Vanished => "vanished",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// =============================================================================
// Driver Metrics
// =============================================================================

/// Metrics shared by the job poller and the driver facade
pub struct DriverMetrics {
    registry: Registry,
    /// Jobs reaching a final verdict, by outcome
    job_outcomes: IntCounterVec,
    /// Individual job status fetches
    job_polls: IntCounter,
    /// Time from first poll to final verdict
    job_wait_seconds: Histogram,
    /// Host-facing operations, by operation and outcome
    operations: IntCounterVec,
}

impl DriverMetrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let job_outcomes = IntCounterVec::new(
            Opts::new("smis_job_outcomes_total", "Remote jobs by final outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let job_polls = IntCounter::new("smis_job_polls_total", "Remote job status fetches")
            .map_err(metrics_error)?;
        let job_wait_seconds = Histogram::with_opts(
            HistogramOpts::new("smis_job_wait_seconds", "Time spent waiting for remote jobs")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )
        .map_err(metrics_error)?;
        let operations = IntCounterVec::new(
            Opts::new("smis_driver_operations_total", "Driver operations by outcome"),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(job_outcomes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(job_polls.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(job_wait_seconds.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            job_outcomes,
            job_polls,
            job_wait_seconds,
            operations,
        })
    }

    #[inline]
    pub fn record_poll(&self) {
        self.job_polls.inc();
    }

    /// Record the final verdict of a job and how long it was awaited
    pub fn record_job(&self, outcome: Outcome, waited: Duration) {
        self.job_outcomes.with_label_values(&[outcome.label()]).inc();
        self.job_wait_seconds.observe(waited.as_secs_f64());
    }

    /// Record a host-facing operation
    pub fn record_operation(&self, operation: &str, success: bool) {
        let outcome = if success {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.operations
            .with_label_values(&[operation, outcome.label()])
            .inc();
    }

    pub fn polls(&self) -> u64 {
        self.job_polls.get()
    }

    pub fn jobs(&self, outcome: Outcome) -> u64 {
        self.job_outcomes.with_label_values(&[outcome.label()]).get()
    }

    pub fn operations(&self, operation: &str, success: bool) -> u64 {
        let outcome = if success {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.operations
            .with_label_values(&[operation, outcome.label()])
            .get()
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for DriverMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverMetrics")
            .field("job_polls", &self.job_polls.get())
            .finish()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
