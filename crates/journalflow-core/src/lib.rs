//! Workflow orchestration engine for journalflow.
//!
//! Definitions are directed graphs of typed steps. The engine runs each
//! started instance as its own tokio task, dispatching Action steps to
//! registered handlers, branching on JEXL conditions, and retrying failed
//! steps with exponential backoff before routing to error handlers.

pub mod config;
pub mod event;
pub mod workflow;

pub use workflow::{StepHandlerRegistry, WorkflowEngine};
