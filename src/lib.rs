//! SMI-S Block Driver
//!
//! Block volume driver for arrays managed through an SMI-S provider:
//! volume provisioning, host masking views and FAST tiering policies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  REST API (axum) / BlockDriver                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │   Masking    │  │ Provisioning │  │   Tiering / Capacity   │  │
//! │  │ Orchestrator │  │    Engine    │  │        Tracker         │  │
//! │  └──────┬───────┘  └──────┬───────┘  └───────────┬────────────┘  │
//! │         └─────────────────┼──────────────────────┘               │
//! │                ┌──────────┴───────────┐                          │
//! │                │ Entity Locator + Job │                          │
//! │                │  Poller + Naming     │                          │
//! │                └──────────┬───────────┘                          │
//! ├───────────────────────────┼──────────────────────────────────────┤
//! │             ManagementClient (SMI-S provider port)               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Engines, driver facade and REST API
//! - [`array`]: Locator, job poller, naming and the simulated array
//! - [`domain`]: Object model, vocabulary and ports
//! - [`config`]: YAML driver configuration
//! - [`metrics`]: Prometheus instrumentation
//! - [`error`]: Error types and handling

pub mod array;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, BlockDriver, CloneOptions, CreateVolume, MaskingOrchestrator,
    ProvisioningEngine, RestRouter, TieringTracker,
};

pub use array::{EntityLocator, JobPoller, PollConfig, SimulatedArray};

pub use config::DriverConfig;

pub use domain::model::{Instance, InstanceName, InvokeOutcome, MethodArgs, ProviderLocation, Value};
pub use domain::ports::{
    ConnectionInfo, Connector, ExposureResult, FabricTopology, ManagementClient, Placement,
    Protocol, UnexposeResult, VolumeSpec, VolumeStats,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::DriverMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
