//! Step handlers and the action-name registry that dispatches to them.
//!
//! Follows the blanket-impl pattern used for other async seams:
//! 1. `StepHandler` uses native async fn in traits (Rust 2024 edition, no async_trait macro)
//! 2. Object-safe `StepHandlerDyn` with boxed futures, blanket-implemented for all handlers
//! 3. `StepHandlerRegistry` stores `Arc<dyn StepHandlerDyn>` resolved once at registration

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;

use journalflow_types::workflow::{StepResult, WorkflowInstance, WorkflowStep};

use super::expression::ExpressionError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while executing a single step.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("no handler registered for action '{0}'")]
    UnknownAction(String),

    /// One attempt exceeded the step's `timeout_secs`.
    #[error("step timed out after {0}s")]
    Timeout(u64),

    /// The handler returned an error or panicked.
    #[error("handler error: {0}")]
    Handler(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Executes the action behind an `Action` (or extension Loop/Parallel) step.
///
/// Handlers may read and write `instance.context` directly; anything placed in
/// the returned `StepResult::output` is merged into the context on success.
pub trait StepHandler: Send + Sync + 'static {
    fn handle(
        &self,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        instance: &'a mut WorkflowInstance,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        instance: &'a mut WorkflowInstance,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>> {
        Box::pin(self.handle(step, instance))
    }
}

/// Adapter turning a synchronous closure into a [`StepHandler`].
pub struct FnHandler<F>(F);

impl<F> StepHandler for FnHandler<F>
where
    F: Fn(&WorkflowStep, &mut WorkflowInstance) -> Result<StepResult, StepError>
        + Send
        + Sync
        + 'static,
{
    fn handle(
        &self,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send {
        async move { (self.0)(step, instance) }
    }
}

/// Wrap a closure as a handler: `registry.register("tag", handler_fn(|step, inst| ...))`.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&WorkflowStep, &mut WorkflowInstance) -> Result<StepResult, StepError>
        + Send
        + Sync
        + 'static,
{
    FnHandler(f)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Case-insensitive action name -> handler table.
#[derive(Default)]
pub struct StepHandlerRegistry {
    handlers: DashMap<String, Arc<dyn StepHandlerDyn>>,
}

impl StepHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with `noop`, `log`, `set_context` and `notify`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("noop", NoopHandler);
        registry.register("log", LogHandler);
        registry.register("set_context", SetContextHandler);
        registry.register("notify", NotifyHandler);
        registry
    }

    /// Register `handler` under `action`, replacing any previous handler.
    pub fn register<H: StepHandler>(&self, action: &str, handler: H) {
        let key = action.to_lowercase();
        if self.handlers.insert(key.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(action = %key, "replaced step handler");
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler<H: StepHandler>(self, action: &str, handler: H) -> Self {
        self.register(action, handler);
        self
    }

    pub fn unregister(&self, action: &str) -> bool {
        self.handlers.remove(&action.to_lowercase()).is_some()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(&action.to_lowercase())
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn resolve(&self, action: &str) -> Option<Arc<dyn StepHandlerDyn>> {
        self.handlers
            .get(&action.to_lowercase())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Run the handler registered for `action`.
    pub async fn dispatch(
        &self,
        action: &str,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        let handler = self
            .resolve(action)
            .ok_or_else(|| StepError::UnknownAction(action.to_string()))?;
        handler.handle_boxed(step, instance).await
    }
}

impl std::fmt::Debug for StepHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Succeeds without output.
pub struct NoopHandler;

impl StepHandler for NoopHandler {
    async fn handle(
        &self,
        _step: &WorkflowStep,
        _instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        Ok(StepResult::ok())
    }
}

/// Writes `parameters.message` (or the step name) to the tracing log.
pub struct LogHandler;

impl StepHandler for LogHandler {
    async fn handle(
        &self,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        let message = step.parameter_str("message").unwrap_or(&step.name);
        tracing::info!(instance_id = %instance.id, step_id = %step.id, "{message}");
        Ok(StepResult::ok())
    }
}

/// Copies the `parameters.values` object into the step output.
pub struct SetContextHandler;

impl StepHandler for SetContextHandler {
    async fn handle(
        &self,
        step: &WorkflowStep,
        _instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        let Some(Value::Object(values)) = step.parameters.get("values") else {
            return Err(StepError::handler(format!(
                "step '{}': set_context requires an object 'values' parameter",
                step.id
            )));
        };
        let mut result = StepResult::ok();
        for (key, value) in values {
            result.output.insert(key.clone(), value.clone());
        }
        Ok(result)
    }
}

/// Records a notification descriptor under `notifications` in the context.
///
/// Delivery is left to whoever observes the instance; the handler only
/// appends `{step_id, title, message, timestamp}` to the list.
pub struct NotifyHandler;

impl StepHandler for NotifyHandler {
    async fn handle(
        &self,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        let mut notifications = match instance.context.get("notifications") {
            Some(Value::Array(existing)) => existing.clone(),
            _ => Vec::new(),
        };
        notifications.push(json!({
            "step_id": step.id,
            "title": step.parameter_str("title").unwrap_or(&step.name),
            "message": step.parameter_str("message").unwrap_or_default(),
            "timestamp": Utc::now().to_rfc3339(),
        }));
        Ok(StepResult::ok().with_output("notifications", Value::Array(notifications)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
