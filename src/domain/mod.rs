//! Domain layer - Remote object model and port definitions
//!
//! Defines the value types of the management-object protocol, the
//! vocabulary of the array's provider, and the traits (ports) that
//! transport adapters implement.

pub mod classes;
pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
