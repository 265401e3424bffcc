//! Daemon library: the admin HTTP surface, metrics, and build info.
//!
//! The binary in `main.rs` wires these against the core crate's
//! supervisor and update controller. Everything here is exported so the
//! integration tests can assemble the same router against fixture
//! backends.

pub mod admin;
pub mod build_info;
pub mod metrics;
