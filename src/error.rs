//! Error types for the SMI-S block driver
//!
//! Provides structured error types for the locator, job poller, masking,
//! provisioning and tiering components, plus the configuration and API layers.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // =========================================================================
    // Management Client Errors
    // =========================================================================
    /// Raised by a management client when an addressed instance does not
    /// exist. The locator converts it to `None`; it only escapes when a
    /// caller addressed the instance directly.
    #[error("Instance not found: {class}/{key}")]
    InstanceNotFound { class: String, key: String },

    #[error("Management transport error: {operation} - {reason}")]
    Transport { operation: String, reason: String },

    #[error("Required resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Backend operation failed: {operation} (code {code}): {description}")]
    BackendOperationFailed {
        operation: String,
        code: u32,
        description: String,
    },

    #[error("Timed out after {waited:?} waiting for {job}; outcome unknown")]
    Timeout { job: String, waited: Duration },

    #[error("Job {job} disappeared before reaching a terminal state")]
    JobNotFound { job: String },

    // =========================================================================
    // Volume Lifecycle Errors
    // =========================================================================
    #[error("Provisioning failed for volume {volume}: {reason}")]
    ProvisioningFailed { volume: String, reason: String },

    #[error("Volume {volume} is not extendable: {reason}")]
    NotExtendable { volume: String, reason: String },

    #[error("Invalid provider location: {0}")]
    InvalidProviderLocation(String),

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the caller should take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Re-query the remote state after a delay before retrying
    RequeryAfter(Duration),
    /// Don't retry, operator intervention required
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Transport { .. } | Error::JobNotFound { .. } => ErrorAction::RetryWithBackoff,

            // The remote job may still be running
            Error::Timeout { .. } => ErrorAction::RequeryAfter(Duration::from_secs(60)),

            // Operator-facing problems - don't retry automatically
            Error::InvalidConfiguration(_)
            | Error::NotExtendable { .. }
            | Error::InvalidProviderLocation(_)
            | Error::ApiValidation(_)
            | Error::YamlParse(_) => ErrorAction::NoRetry,

            // All other errors - retry with backoff
            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout { .. } | Error::JobNotFound { .. }
        )
    }

    /// Whether the error reports a missing remote instance
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::InstanceNotFound { .. })
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Timeout {
            job: "SE_ConcreteJob.InstanceID=\"1\"".into(),
            waited: Duration::from_secs(5),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeryAfter(Duration::from_secs(60))
        );

        let err = Error::InvalidConfiguration("missing port group".into());
        assert_eq!(err.action(), ErrorAction::NoRetry);

        let err = Error::BackendOperationFailed {
            operation: "CreateMaskingView".into(),
            code: 99,
            description: "Failure".into(),
        };
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Transport {
            operation: "EnumerateInstanceNames".into(),
            reason: "connection reset".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::InvalidConfiguration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_not_found_classification() {
        let err = Error::InstanceNotFound {
            class: "Symm_StorageVolume".into(),
            key: "DeviceID=9".into(),
        };
        assert!(err.is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }
}
