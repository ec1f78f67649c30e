//! `WorkflowEngine`: the orchestrator value that owns definitions, handlers,
//! the expression evaluator and the instance registry.
//!
//! The engine is cheap to clone (`Arc` inner). Each started instance runs as
//! its own tokio task; the engine hands back either a bare id (`start`) or a
//! supervised [`InstanceHandle`] (`spawn`).

use std::path::Path;
use std::sync::Arc;

use journalflow_types::config::EngineConfig;
use journalflow_types::event::InstanceEvent;
use journalflow_types::workflow::{ContextMap, InstanceStatus, WorkflowDefinition, WorkflowInstance};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::load_engine_config;
use crate::event::bus::EventBus;

use super::definition::{discover_definitions, DefinitionError, DefinitionStore};
use super::expression::{ConditionEvaluator, JexlEvaluator};
use super::handler::StepHandlerRegistry;
use super::instance::InstanceRegistry;
use super::retry::RetryExecutor;
use super::runner::InstanceRunner;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("instance {id} is still {status:?}")]
    InstanceStillRunning { id: Uuid, status: InstanceStatus },

    #[error("sub-workflow depth {depth} exceeds maximum {max}")]
    SubWorkflowDepthExceeded { depth: u32, max: u32 },

    #[error("no tokio runtime available to run workflow instances")]
    NoRuntime,

    #[error("instance task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// InstanceHandle
// ---------------------------------------------------------------------------

/// Supervision handle for a spawned instance.
#[derive(Debug)]
pub struct InstanceHandle {
    id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<WorkflowInstance>,
}

impl InstanceHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation; observed at the instance's next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the instance when dropped unless disarmed.
    pub(crate) fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Await the runner task and return the final instance state.
    pub async fn wait(self) -> Result<WorkflowInstance, EngineError> {
        self.join.await.map_err(|e| EngineError::Join(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    config: EngineConfig,
    definitions: DefinitionStore,
    instances: InstanceRegistry,
    handlers: StepHandlerRegistry,
    evaluator: Box<dyn ConditionEvaluator>,
    events: EventBus,
    retry: RetryExecutor,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine using the default JEXL condition evaluator.
    pub fn new(config: EngineConfig, handlers: StepHandlerRegistry) -> Self {
        Self::with_evaluator(config, handlers, JexlEvaluator::new())
    }

    pub fn with_evaluator(
        config: EngineConfig,
        handlers: StepHandlerRegistry,
        evaluator: impl ConditionEvaluator + 'static,
    ) -> Self {
        let inner = EngineInner {
            definitions: DefinitionStore::new(config.strict_termination),
            instances: InstanceRegistry::new(),
            handlers,
            evaluator: Box::new(evaluator),
            events: EventBus::new(config.event_bus_capacity),
            retry: RetryExecutor::new(config.retry_backoff_base_ms),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Build an engine from `{data_dir}/journalflow.toml`, registering every
    /// definition found under the configured `definitions_dir`.
    pub async fn open(data_dir: &Path, handlers: StepHandlerRegistry) -> Result<Self, EngineError> {
        let config = load_engine_config(data_dir).await;
        let definitions_dir = config.definitions_dir.clone();
        let engine = Self::new(config, handlers);
        if let Some(dir) = definitions_dir {
            engine.load_definitions_from(&dir)?;
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Handler table; handlers may be registered while the engine runs.
    pub fn handlers(&self) -> &StepHandlerRegistry {
        &self.inner.handlers
    }

    pub(crate) fn evaluator(&self) -> &dyn ConditionEvaluator {
        self.inner.evaluator.as_ref()
    }

    pub(crate) fn retry(&self) -> &RetryExecutor {
        &self.inner.retry
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.inner.events
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and register a definition, replacing any with the same id.
    pub fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        Ok(self.inner.definitions.register(definition)?)
    }

    pub fn definition(&self, id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        Ok(self.inner.definitions.get(id)?)
    }

    pub fn definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.inner.definitions.list()
    }

    pub fn remove_definition(&self, id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        Ok(self.inner.definitions.remove(id)?)
    }

    /// Register every valid definition file under `dir`; invalid ones are
    /// logged and skipped. Returns the number registered.
    pub fn load_definitions_from(&self, dir: &Path) -> Result<usize, EngineError> {
        let mut registered = 0;
        for (path, definition) in discover_definitions(dir)? {
            match self.inner.definitions.register(definition) {
                Ok(_) => registered += 1,
                Err(e) => tracing::warn!(?path, error = %e, "skipping invalid definition"),
            }
        }
        tracing::info!(dir = %dir.display(), registered, "loaded workflow definitions");
        Ok(registered)
    }

    // -----------------------------------------------------------------------
    // Starting instances
    // -----------------------------------------------------------------------

    /// Start an instance and return its id without waiting for it.
    ///
    /// Fails synchronously only when the definition is unknown (or no tokio
    /// runtime is available); every later problem surfaces as instance state.
    pub fn start(&self, definition_id: &str, initial_context: ContextMap) -> Result<Uuid, EngineError> {
        self.spawn(definition_id, initial_context).map(|handle| handle.id())
    }

    /// Start an instance and return a handle for cancelling and awaiting it.
    pub fn spawn(
        &self,
        definition_id: &str,
        initial_context: ContextMap,
    ) -> Result<InstanceHandle, EngineError> {
        let definition = self.inner.definitions.get(definition_id)?;
        self.spawn_instance(definition, initial_context, None, 0)
    }

    /// Start every definition whose `trigger_event` matches `event_name`.
    pub fn trigger(&self, event_name: &str, initial_context: ContextMap) -> Result<Vec<Uuid>, EngineError> {
        let matching = self.inner.definitions.find_by_trigger(event_name);
        tracing::debug!(event = event_name, matches = matching.len(), "dispatching trigger");
        matching
            .into_iter()
            .map(|definition| {
                self.spawn_instance(definition, initial_context.clone(), None, 0)
                    .map(|handle| handle.id())
            })
            .collect()
    }

    /// Start a nested instance on behalf of a SubWorkflow step.
    pub(crate) fn spawn_child(
        &self,
        definition_id: &str,
        initial_context: ContextMap,
        parent_id: Uuid,
        parent_cancel: &CancellationToken,
        depth: u32,
    ) -> Result<InstanceHandle, EngineError> {
        let max = self.inner.config.max_sub_workflow_depth;
        if depth > max {
            return Err(EngineError::SubWorkflowDepthExceeded { depth, max });
        }
        let definition = self.inner.definitions.get(definition_id)?;
        self.spawn_instance(
            definition,
            initial_context,
            Some((parent_id, parent_cancel.child_token())),
            depth,
        )
    }

    fn spawn_instance(
        &self,
        definition: Arc<WorkflowDefinition>,
        initial_context: ContextMap,
        parent: Option<(Uuid, CancellationToken)>,
        depth: u32,
    ) -> Result<InstanceHandle, EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let mut instance = WorkflowInstance::new(&definition, initial_context);
        let cancel = match parent {
            Some((parent_id, token)) => {
                instance = instance.with_parent(parent_id);
                token
            }
            None => CancellationToken::new(),
        };

        let id = instance.id;
        let control = self.inner.instances.insert(&instance, cancel.clone());
        let span = tracing::info_span!(
            "workflow_instance",
            instance_id = %id,
            definition_id = %definition.id,
            depth
        );
        let runner = InstanceRunner::new(self.clone(), definition, instance, control, depth);
        let join = runtime.spawn(runner.run().instrument(span));

        tracing::debug!(instance_id = %id, "spawned workflow instance");
        Ok(InstanceHandle { id, cancel, join })
    }

    // -----------------------------------------------------------------------
    // Instance control surface
    // -----------------------------------------------------------------------

    pub fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.inner.instances.get(id)
    }

    /// Running and Paused instances.
    pub fn list_active(&self) -> Vec<WorkflowInstance> {
        self.inner.instances.list_active()
    }

    pub fn list_instances(&self) -> Vec<WorkflowInstance> {
        self.inner.instances.list()
    }

    pub fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        self.inner.instances.cancel(id)
    }

    /// Ask the instance to pause before its next step.
    pub fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        self.inner.instances.set_paused(id, true)
    }

    pub fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        self.inner.instances.set_paused(id, false)
    }

    /// Wait for the instance to reach a terminal status.
    pub async fn wait(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.inner.instances.wait(id).await
    }

    /// Forget a terminal instance. Running or paused instances are rejected.
    pub fn discard(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.inner.instances.discard(id)
    }

    /// Receive lifecycle events for every instance started after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.inner.config)
            .field("definitions", &self.inner.definitions.len())
            .field("instances", &self.inner.instances)
            .field("handlers", &self.inner.handlers)
            .finish()
    }
}

/// Convenience for building an initial context from `(key, value)` pairs.
pub fn context_from<I, K>(pairs: I) -> ContextMap
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
