//! Error types for call bookkeeping.

use thiserror::Error;

use crate::types::{CallId, CallStatus};

/// Result type alias for call state operations.
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors raised by the call state machine and tree reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    /// A mutation was attempted that the call's current state forbids.
    #[error("Invalid state transition for call {call_id}: {from} -> {to}")]
    InvalidStateTransition {
        call_id: CallId,
        from: CallStatus,
        to: CallStatus,
    },

    /// Two records claimed the same call id.
    #[error("Duplicate call id: {0}")]
    DuplicateCall(CallId),
}
