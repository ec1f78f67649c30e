use thiserror::Error;

use crate::workflow::InstanceStatus;

/// Errors raised by instance state bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceError {
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },
}
