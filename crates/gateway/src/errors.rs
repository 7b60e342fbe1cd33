//! Error types for the gateway.
//!
//! Guard refusals are *not* errors: they are [`crate::Decision::Deny`] values.
//! The types here cover the few conditions that genuinely fail a call: a pool
//! waiter that was never admitted, a rejected configuration, and collaborator
//! faults (which the gateway logs and swallows rather than propagating).

use std::time::Duration;

use thiserror::Error;

use crate::SessionId;

// ---------------------------------------------------------------------------
// Gateway-level errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the gateway's own components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// A queued pool request was not promoted to an active slot in time.
    ///
    /// Only the waiter that timed out observes this; the rest of the queue is
    /// unaffected.
    #[error("Session acquisition timed out for {session_id} after {waited:?}")]
    AcquisitionTimeout {
        /// Identifier that would have been assigned to the slot.
        session_id: SessionId,
        /// How long the request waited in the queue.
        waited: Duration,
    },

    /// The pool stopped accepting work while the request was queued.
    #[error("Session pool is closed")]
    PoolClosed,

    /// The gateway configuration is invalid.
    ///
    /// Produced at construction time; components never run with an invalid
    /// config.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

/// Failure reported by a collaborator (cache, audit sink, monitor).
///
/// The gateway never propagates these to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{collaborator} failed: {message}")]
pub struct CollaboratorError {
    /// Which collaborator failed (e.g. `"decision cache"`).
    pub collaborator: &'static str,
    /// Collaborator-supplied description.
    pub message: String,
}

impl CollaboratorError {
    /// Creates a new collaborator error.
    pub fn new(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Composite errors
// ---------------------------------------------------------------------------

/// Failure of one operation inside [`crate::SessionPool::execute_batch`].
#[derive(Debug, Error)]
pub enum BatchError<E> {
    /// No slot could be obtained; the task never ran.
    #[error(transparent)]
    Acquisition(GatewayError),
    /// The task ran and failed. Its slot was released regardless.
    #[error("batch task failed: {0}")]
    Task(E),
}

/// Failure of a [`crate::ExplorationGuard::run_guarded`] call.
#[derive(Debug, Error)]
pub enum GuardedError<E> {
    /// The guard refused the operation before it started.
    #[error("operation denied: {0}")]
    Denied(crate::DenialReason),
    /// The operation itself failed.
    #[error("guarded operation failed: {0}")]
    Operation(E),
}
