//! Core library for the Payram self-updating supervisor agent.
//!
//! This crate owns the release lifecycle (fetch, verify, stage, atomic
//! switch, health check, rollback), the long-lived process supervisor for
//! the chat and MCP children, and the durable state the agent persists
//! across crashes: the update status document, the secret store, and the
//! release layout with its `current`/`previous` symlink pair.
//!
//! The admin HTTP surface lives in the daemon crate; everything here is
//! usable and testable without it.

pub mod artifact;
pub mod config;
pub mod fs_atomic;
pub mod layout;
pub mod manifest;
pub mod secrets;
pub mod status;
pub mod supervisor;
pub mod update;
pub mod version;
