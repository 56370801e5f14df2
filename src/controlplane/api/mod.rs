//! API Module
//!
//! REST surface of the block driver plus the server that hosts it.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
