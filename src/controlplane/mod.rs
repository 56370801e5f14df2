//! Control Plane Module
//!
//! The engines that turn host volume-manager requests into array
//! operations, the driver facade binding them, and its REST surface.

pub mod api;
pub mod driver;
pub mod groups;
pub mod masking;
pub mod provision;
pub mod tiering;

pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use driver::BlockDriver;
pub use groups::GroupOps;
pub use masking::{MaskingConfig, MaskingOrchestrator};
pub use provision::{CloneOptions, CreateVolume, ProvisioningEngine};
pub use tiering::{bytes_to_gb, Capacity, TieringTracker};
