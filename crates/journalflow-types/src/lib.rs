//! Shared domain types for journalflow.
//!
//! This crate contains the types that flow through the workflow engine:
//! definitions and steps, runtime instances with their execution logs,
//! step results, lifecycle events, and the engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
