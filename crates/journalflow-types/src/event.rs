//! Event types for the journalflow instance event bus.
//!
//! `InstanceEvent` is the lifecycle event broadcast while instances run.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow instance execution.
///
/// Subscribers (UI, audit logging, tests) observe instance progress without
/// polling the instance registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceEvent {
    /// An instance left `Created` and began executing its start step.
    InstanceStarted {
        instance_id: Uuid,
        definition_id: String,
        parent_id: Option<Uuid>,
    },

    /// A step finished successfully (after however many attempts it took).
    StepCompleted {
        instance_id: Uuid,
        step_id: String,
        attempts: u32,
    },

    /// A step failed after exhausting its attempts.
    StepFailed {
        instance_id: Uuid,
        step_id: String,
        error: String,
        /// Step the runner reroutes to, when the failed step has one.
        error_handler: Option<String>,
    },

    InstancePaused { instance_id: Uuid },

    InstanceResumed { instance_id: Uuid },

    InstanceCompleted { instance_id: Uuid },

    InstanceFailed { instance_id: Uuid, error: String },

    InstanceCancelled { instance_id: Uuid },
}

impl InstanceEvent {
    /// The instance this event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::InstanceStarted { instance_id, .. }
            | Self::StepCompleted { instance_id, .. }
            | Self::StepFailed { instance_id, .. }
            | Self::InstancePaused { instance_id }
            | Self::InstanceResumed { instance_id }
            | Self::InstanceCompleted { instance_id }
            | Self::InstanceFailed { instance_id, .. }
            | Self::InstanceCancelled { instance_id } => *instance_id,
        }
    }

    /// Whether this event ends the instance's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InstanceCompleted { .. }
                | Self::InstanceFailed { .. }
                | Self::InstanceCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_serializes_with_type_tag() {
        let id = Uuid::now_v7();
        let event = InstanceEvent::StepFailed {
            instance_id: id,
            step_id: "validate".to_string(),
            error: "timed out".to_string(),
            error_handler: Some("recover".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_failed");
        assert_eq!(json["error_handler"], "recover");

        let back: InstanceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_instance_id_accessor() {
        let id = Uuid::now_v7();
        let events = [
            InstanceEvent::InstanceStarted {
                instance_id: id,
                definition_id: "wf".to_string(),
                parent_id: None,
            },
            InstanceEvent::InstancePaused { instance_id: id },
            InstanceEvent::InstanceFailed {
                instance_id: id,
                error: "boom".to_string(),
            },
        ];
        assert!(events.iter().all(|e| e.instance_id() == id));
    }

    #[test]
    fn test_terminal_events() {
        let id = Uuid::now_v7();
        assert!(InstanceEvent::InstanceCancelled { instance_id: id }.is_terminal());
        assert!(InstanceEvent::InstanceCompleted { instance_id: id }.is_terminal());
        assert!(!InstanceEvent::InstanceResumed { instance_id: id }.is_terminal());
    }
}
