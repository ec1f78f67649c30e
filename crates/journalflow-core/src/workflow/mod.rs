//! Workflow engine core: definitions, step dispatch, retries and instance execution.
//!
//! - `definition` -- YAML parsing, validation, reachability lint, definition store
//! - `expression` -- JEXL evaluator for Decision conditions
//! - `handler` -- step handler trait, registry and built-in actions
//! - `retry` -- per-step retry/timeout executor with exponential backoff
//! - `instance` -- instance registry (watch snapshots) and execution logger
//! - `runner` -- the per-instance execution loop
//! - `engine` -- `WorkflowEngine`, the orchestrator value tying it all together

pub mod definition;
pub mod engine;
pub mod expression;
pub mod handler;
pub mod instance;
pub mod retry;
pub mod runner;

pub use definition::{DefinitionError, DefinitionStore};
pub use engine::{context_from, EngineError, InstanceHandle, WorkflowEngine};
pub use expression::{ConditionEvaluator, ExpressionError, JexlEvaluator};
pub use handler::{handler_fn, StepError, StepHandler, StepHandlerRegistry};
pub use runner::DEFAULT_SUB_INSTANCE_KEY;
