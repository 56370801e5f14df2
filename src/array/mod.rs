//! Array access layer
//!
//! Primitives shared by every engine: stateless lookups, deterministic
//! naming, job polling, plus an in-memory array speaking the same protocol.

pub mod jobs;
pub mod locator;
pub mod naming;
pub mod simulator;

pub use jobs::{JobPoller, JobStatus, PollConfig, SyncTarget, SyncWaiter};
pub use locator::{EntityLocator, LunMapping, VolumeFacts};
pub use naming::MaskingNames;
pub use simulator::SimulatedArray;
