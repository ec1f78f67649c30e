//! Instance registry and execution logger.
//!
//! Every live instance is owned by exactly one runner task. The runner
//! publishes snapshots through a `watch` channel held in the registry, so
//! readers (`get`, `list_active`, `wait`) never touch the runner's state and
//! only ever see whole, consistent snapshots.

use std::sync::Arc;

use dashmap::DashMap;
use journalflow_types::workflow::{ExecutionLogEntry, WorkflowInstance, WorkflowStep};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::EngineError;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct InstanceEntry {
    state: Arc<watch::Sender<WorkflowInstance>>,
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

/// The runner's side of a registry entry.
///
/// Held by the runner task for the lifetime of the instance; it is the only
/// writer of the snapshot channel.
pub struct InstanceControl {
    state: Arc<watch::Sender<WorkflowInstance>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) pause: watch::Receiver<bool>,
}

impl InstanceControl {
    /// Replace the published snapshot with the runner's current state.
    pub fn publish(&self, instance: &WorkflowInstance) {
        self.state.send_replace(instance.clone());
    }

    pub fn is_pause_requested(&self) -> bool {
        *self.pause.borrow()
    }
}

/// Tracks every instance the engine has started until it is discarded.
#[derive(Default)]
pub struct InstanceRegistry {
    entries: DashMap<Uuid, InstanceEntry>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created instance and hand back the runner's control.
    pub fn insert(&self, instance: &WorkflowInstance, cancel: CancellationToken) -> InstanceControl {
        let (state, _) = watch::channel(instance.clone());
        let (pause, pause_rx) = watch::channel(false);
        let state = Arc::new(state);
        self.entries.insert(
            instance.id,
            InstanceEntry {
                state: Arc::clone(&state),
                cancel: cancel.clone(),
                pause: Arc::new(pause),
            },
        );
        InstanceControl {
            state,
            cancel,
            pause: pause_rx,
        }
    }

    /// Latest snapshot of an instance.
    pub fn get(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.entries
            .get(&id)
            .map(|entry| entry.state.borrow().clone())
            .ok_or(EngineError::InstanceNotFound(id))
    }

    /// Snapshots of Running and Paused instances, oldest first.
    pub fn list_active(&self) -> Vec<WorkflowInstance> {
        let mut active: Vec<_> = self
            .snapshots()
            .into_iter()
            .filter(|i| i.status.is_active())
            .collect();
        active.sort_by_key(|i| i.id);
        active
    }

    /// Snapshots of every tracked instance, oldest first.
    pub fn list(&self) -> Vec<WorkflowInstance> {
        let mut all = self.snapshots();
        all.sort_by_key(|i| i.id);
        all
    }

    fn snapshots(&self) -> Vec<WorkflowInstance> {
        self.entries
            .iter()
            .map(|entry| entry.state.borrow().clone())
            .collect()
    }

    /// Request cancellation. Observed by the runner at its next suspension point.
    pub fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Set or clear the pause flag. Observed by the runner between steps.
    pub fn set_paused(&self, id: Uuid, paused: bool) -> Result<(), EngineError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        entry.pause.send_replace(paused);
        Ok(())
    }

    /// Wait until the instance reaches a terminal status and return that snapshot.
    pub async fn wait(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let mut rx = self
            .entries
            .get(&id)
            .map(|entry| entry.state.subscribe())
            .ok_or(EngineError::InstanceNotFound(id))?;

        let terminal = rx
            .wait_for(|i| i.status.is_terminal())
            .await
            .map(|snapshot| snapshot.clone());
        let snapshot = match terminal {
            Ok(snapshot) => snapshot,
            // Sender dropped: the entry was discarded, so the last value is final.
            Err(_) => rx.borrow().clone(),
        };
        Ok(snapshot)
    }

    /// Drop a terminal instance from the registry, returning its final snapshot.
    pub fn discard(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let status = self.get(id)?.status;
        if !status.is_terminal() {
            return Err(EngineError::InstanceStillRunning { id, status });
        }
        self.entries
            .remove(&id)
            .map(|(_, entry)| entry.state.borrow().clone())
            .ok_or(EngineError::InstanceNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Appends execution log entries to an instance and mirrors them to `tracing`.
///
/// Stateless: all functions take the runner-owned instance they write to.
pub struct InstanceLogger;

impl InstanceLogger {
    pub fn info(instance: &mut WorkflowInstance, step: &WorkflowStep, message: impl Into<String>) {
        Self::append(instance, ExecutionLogEntry::new(step, message, false));
    }

    pub fn error(instance: &mut WorkflowInstance, step: &WorkflowStep, message: impl Into<String>) {
        Self::append(instance, ExecutionLogEntry::new(step, message, true));
    }

    /// Record the outcome of one retry-executor attempt (`attempt` is 1-based).
    pub fn attempt(
        instance: &mut WorkflowInstance,
        step: &WorkflowStep,
        attempt: u32,
        total: u32,
        error: Option<&str>,
    ) {
        let entry = match error {
            None => ExecutionLogEntry::new(step, format!("attempt {attempt}/{total} succeeded"), false),
            Some(err) => {
                ExecutionLogEntry::new(step, format!("attempt {attempt}/{total} failed: {err}"), true)
            }
        };
        Self::append(instance, entry.with_attempt(attempt));
    }

    pub fn append(instance: &mut WorkflowInstance, entry: ExecutionLogEntry) {
        if entry.is_error {
            tracing::warn!(
                instance_id = %instance.id,
                step_id = %entry.step_id,
                attempt = entry.attempt,
                "{}",
                entry.message
            );
        } else {
            tracing::info!(
                instance_id = %instance.id,
                step_id = %entry.step_id,
                attempt = entry.attempt,
                "{}",
                entry.message
            );
        }
        instance.append_log(entry);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
