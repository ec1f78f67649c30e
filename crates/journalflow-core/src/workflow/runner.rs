//! Instance runner: drives one workflow instance from its start step to a
//! terminal status.
//!
//! The runner task is the single writer of its `WorkflowInstance`. After each
//! transition it publishes a snapshot to the instance registry and emits the
//! matching lifecycle event. Steps run strictly sequentially; every step except
//! `End` goes through the retry executor.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use journalflow_types::event::InstanceEvent;
use journalflow_types::workflow::{
    InstanceStatus, StepResult, StepType, WorkflowDefinition, WorkflowInstance, WorkflowStep,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::engine::WorkflowEngine;
use super::handler::{StepError, StepHandler};
use super::instance::{InstanceControl, InstanceLogger};
use super::retry::panic_message;

/// Context key a SubWorkflow step stores the child instance id under by default.
pub const DEFAULT_SUB_INSTANCE_KEY: &str = "sub_instance_id";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Reasons an instance stops without completing.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A step failed after all attempts and had no error handler.
    #[error("{0}")]
    InstanceFailed(String),

    #[error("step '{0}' not found in definition")]
    StepNotFound(String),

    #[error("step limit of {0} executions exceeded")]
    StepLimitExceeded(u64),

    #[error("instance cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Step dispatch by type
// ---------------------------------------------------------------------------

/// Executes one attempt of a step according to its type.
///
/// Handed to the retry executor as the handler for every non-End step.
struct StepDispatcher {
    engine: WorkflowEngine,
    cancel: CancellationToken,
    depth: u32,
}

impl StepHandler for StepDispatcher {
    async fn handle(
        &self,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        match step.step_type {
            StepType::Start | StepType::End => Ok(StepResult::ok()),
            StepType::Action => {
                let action = step.parameter_str("action").unwrap_or_default();
                if action.is_empty() {
                    return Err(StepError::UnknownAction(String::new()));
                }
                self.engine.handlers().dispatch(action, step, instance).await
            }
            StepType::Decision => self.decide(step, instance),
            StepType::Wait => {
                let ms = step
                    .parameter_u64("duration")
                    .unwrap_or(self.engine.config().default_wait_ms);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(StepResult::ok())
            }
            StepType::Loop | StepType::Parallel => self.extension(step, instance).await,
            StepType::SubWorkflow => self.sub_workflow(step, instance).await,
        }
    }
}

impl StepDispatcher {
    fn decide(
        &self,
        step: &WorkflowStep,
        instance: &WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        let condition = step
            .condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let decision = match condition {
            None => true,
            Some(expr) => self.engine.evaluator().evaluate_bool(expr, &instance.context)?,
        };
        Ok(StepResult::decided(decision))
    }

    /// Loop and Parallel delegate to a registered handler named by `parameters.action`.
    async fn extension(
        &self,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        let registered = step
            .parameter_str("action")
            .filter(|action| self.engine.handlers().contains(action));
        match registered {
            Some(action) => self.engine.handlers().dispatch(action, step, instance).await,
            None => {
                InstanceLogger::info(
                    instance,
                    step,
                    format!(
                        "{:?} step has no registered handler; continuing",
                        step.step_type
                    ),
                );
                Ok(StepResult::ok())
            }
        }
    }

    async fn sub_workflow(
        &self,
        step: &WorkflowStep,
        instance: &mut WorkflowInstance,
    ) -> Result<StepResult, StepError> {
        let workflow_id = step.parameter_str("workflow_id").ok_or_else(|| {
            StepError::handler(format!("sub-workflow step '{}' has no workflow_id", step.id))
        })?;

        let mut seed = instance.context.clone();
        if let Some(Value::Object(input)) = step.parameters.get("input") {
            seed.extend(input.clone());
        }

        let handle = self
            .engine
            .spawn_child(workflow_id, seed, instance.id, &self.cancel, self.depth + 1)
            .map_err(|e| StepError::handler(e.to_string()))?;
        let child_id = handle.id();
        let key = step
            .parameter_str("output_key")
            .unwrap_or(DEFAULT_SUB_INSTANCE_KEY);
        InstanceLogger::info(
            instance,
            step,
            format!("started sub-workflow '{workflow_id}' as {child_id}"),
        );

        if !step.parameter_bool("wait").unwrap_or(false) {
            return Ok(StepResult::ok().with_output(key, json!(child_id.to_string())));
        }

        // A timed-out or cancelled attempt drops this future; the child goes with it.
        let abandon = handle.cancel_on_drop();
        let child = handle
            .wait()
            .await
            .map_err(|e| StepError::handler(e.to_string()))?;
        let _ = abandon.disarm();
        if child.status == InstanceStatus::Completed {
            Ok(StepResult::ok().with_output(key, json!(child_id.to_string())))
        } else {
            Ok(StepResult::failure(format!(
                "sub-workflow {child_id} ended {:?}: {}",
                child.status,
                child.error_message.unwrap_or_default()
            ))
            .with_output(key, json!(child_id.to_string())))
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub(crate) struct InstanceRunner {
    engine: WorkflowEngine,
    definition: Arc<WorkflowDefinition>,
    instance: WorkflowInstance,
    control: InstanceControl,
    depth: u32,
}

impl InstanceRunner {
    pub(crate) fn new(
        engine: WorkflowEngine,
        definition: Arc<WorkflowDefinition>,
        instance: WorkflowInstance,
        control: InstanceControl,
        depth: u32,
    ) -> Self {
        Self {
            engine,
            definition,
            instance,
            control,
            depth,
        }
    }

    /// Run to a terminal status and return the final instance.
    ///
    /// Panics escaping the loop are caught here and fail the instance.
    pub(crate) async fn run(mut self) -> WorkflowInstance {
        let outcome = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(RunnerError::InstanceFailed(format!(
                "instance runner panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        self.finish(outcome);
        self.instance
    }

    async fn drive(&mut self) -> Result<(), RunnerError> {
        let definition = Arc::clone(&self.definition);
        let start = definition
            .start_step()
            .ok_or_else(|| RunnerError::StepNotFound("<start>".to_string()))?;

        self.set_status(InstanceStatus::Running);
        self.emit(InstanceEvent::InstanceStarted {
            instance_id: self.instance.id,
            definition_id: self.instance.definition_id.clone(),
            parent_id: self.instance.parent_id,
        });

        let dispatcher = StepDispatcher {
            engine: self.engine.clone(),
            cancel: self.control.cancel.clone(),
            depth: self.depth,
        };
        let max_steps = self.engine.config().max_steps_per_instance;
        let mut executed: u64 = 0;
        let mut current = start.id.clone();

        loop {
            if self.control.cancel.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }
            self.wait_if_paused().await?;

            executed += 1;
            if executed > max_steps {
                return Err(RunnerError::StepLimitExceeded(max_steps));
            }

            let step = definition
                .step(&current)
                .ok_or_else(|| RunnerError::StepNotFound(current.clone()))?;
            self.instance.current_step = Some(step.id.clone());
            InstanceLogger::info(&mut self.instance, step, format!("entering {:?} step", step.step_type));
            self.publish();

            if step.step_type == StepType::End {
                InstanceLogger::info(&mut self.instance, step, "reached end step");
                return Ok(());
            }

            let outcome = match self
                .engine
                .retry()
                .execute(&dispatcher, step, &mut self.instance, &self.control.cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(StepError::Cancelled) => return Err(RunnerError::Cancelled),
                Err(e) => return Err(RunnerError::InstanceFailed(e.to_string())),
            };

            if outcome.result.success {
                self.instance.merge_output(&outcome.result.output);
                self.emit(InstanceEvent::StepCompleted {
                    instance_id: self.instance.id,
                    step_id: step.id.clone(),
                    attempts: outcome.attempts,
                });

                let next = match step.step_type {
                    StepType::Decision => {
                        let branch = if outcome.result.decision.unwrap_or(true) { 0 } else { 1 };
                        InstanceLogger::info(
                            &mut self.instance,
                            step,
                            format!("condition evaluated to {}", branch == 0),
                        );
                        step.next_steps.get(branch)
                    }
                    _ => step.next_steps.first(),
                };

                match next {
                    Some(next) => current = next.clone(),
                    None => {
                        InstanceLogger::info(&mut self.instance, step, "no next step; completing");
                        return Ok(());
                    }
                }
            } else {
                let error = outcome.result.error_message();
                self.emit(InstanceEvent::StepFailed {
                    instance_id: self.instance.id,
                    step_id: step.id.clone(),
                    error: error.clone(),
                    error_handler: step.error_handler.clone(),
                });

                match &step.error_handler {
                    Some(handler) => {
                        InstanceLogger::error(
                            &mut self.instance,
                            step,
                            format!("step failed ({error}); routing to error handler '{handler}'"),
                        );
                        current = handler.clone();
                    }
                    None => {
                        InstanceLogger::error(&mut self.instance, step, format!("step failed: {error}"));
                        return Err(RunnerError::InstanceFailed(format!(
                            "step '{}' failed: {error}",
                            step.id
                        )));
                    }
                }
            }
            self.publish();
        }
    }

    /// Block between steps while a pause is requested.
    async fn wait_if_paused(&mut self) -> Result<(), RunnerError> {
        if !self.control.is_pause_requested() {
            return Ok(());
        }

        self.set_status(InstanceStatus::Paused);
        self.emit(InstanceEvent::InstancePaused {
            instance_id: self.instance.id,
        });

        let cancel = self.control.cancel.clone();
        loop {
            let paused = *self.control.pause.borrow_and_update();
            if !paused {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
                changed = self.control.pause.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_status(InstanceStatus::Running);
        self.emit(InstanceEvent::InstanceResumed {
            instance_id: self.instance.id,
        });
        Ok(())
    }

    fn finish(&mut self, outcome: Result<(), RunnerError>) {
        let instance_id = self.instance.id;
        let (status, event) = match outcome {
            Ok(()) => (
                InstanceStatus::Completed,
                InstanceEvent::InstanceCompleted { instance_id },
            ),
            Err(RunnerError::Cancelled) => (
                InstanceStatus::Cancelled,
                InstanceEvent::InstanceCancelled { instance_id },
            ),
            Err(e) => {
                let error = e.to_string();
                self.instance.error_message = Some(error.clone());
                (
                    InstanceStatus::Failed,
                    InstanceEvent::InstanceFailed { instance_id, error },
                )
            }
        };

        self.set_status(status);
        tracing::info!(
            instance_id = %instance_id,
            definition_id = %self.instance.definition_id,
            status = ?self.instance.status,
            error = self.instance.error_message.as_deref(),
            "workflow instance finished"
        );
        self.emit(event);
    }

    /// Apply a status transition and publish the snapshot.
    fn set_status(&mut self, status: InstanceStatus) {
        if let Err(e) = self.instance.transition(status) {
            tracing::error!(instance_id = %self.instance.id, error = %e, "forcing status");
            self.instance.status = status;
            if status.is_terminal() {
                self.instance.ended_at = Some(chrono::Utc::now());
                self.instance.current_step = None;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.control.publish(&self.instance);
    }

    fn emit(&self, event: InstanceEvent) {
        self.engine.events().publish(event);
    }
}
