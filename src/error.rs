//! The error taxonomy surfaced at the store boundary (spec §6/§7).

use crate::graph::RefId;
use thiserror::Error;

/// Errors raised by the reactive core.
///
/// Structural/graph errors are raised synchronously at the offending call
/// and leave the graph unmodified. Contract violations (closed branch,
/// double install, invalid transition) are raised the same way. Async
/// failures (saga handlers, query fetches, CRDT messages) are carried in
/// the async result type of the operation that produced them rather than
/// panicking.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Adding an edge would have introduced a cycle; the graph was left
    /// unmodified.
    #[error("adding an edge from {from:?} to {to:?} would introduce a cycle")]
    Cycle {
        /// The node that would have gained the new source.
        from: RefId,
        /// The would-be source.
        to: RefId,
    },

    /// A flush re-entered more than the configured bound (default 32).
    #[error("flush re-entered more than {bound} times; likely feedback loop")]
    FeedbackLoop {
        /// The configured bound that was exceeded.
        bound: u32,
    },

    /// An operation was attempted on a branch after it was merged or
    /// discarded.
    #[error("branch {0:?} is closed")]
    BranchClosed(RefId),

    /// `send` was called with no handler registered for
    /// `(currentState, event)`.
    #[error("no transition registered for the current state and event")]
    NoTransition,

    /// A guard rejected the requested transition.
    #[error("guard rejected the transition")]
    GuardBlocked,

    /// `send` was called while a prior async transition was in flight.
    #[error("a transition is already in progress")]
    AlreadyTransitioning,

    /// An operation targeted a saga that is not running.
    #[error("saga is not running")]
    SagaNotRunning,

    /// `runSaga` was called for a saga that is already running.
    #[error("saga is already running")]
    SagaAlreadyRunning,

    /// The task (or the operation it was awaiting) was cancelled.
    #[error("task was cancelled")]
    Cancelled,

    /// A query fetch was superseded by a newer fetch before it completed.
    #[error("query fetch was superseded")]
    QueryCancelled,

    /// `installModule` was called twice for the same module type.
    #[error("module already installed")]
    ModuleAlreadyInstalled,

    /// An operation targeted a module that was never installed.
    #[error("module not installed")]
    ModuleNotInstalled,

    /// A serialized session or message used a schema version this build
    /// does not understand.
    #[error("unsupported schema version {found}, expected {expected}")]
    UnsupportedVersion {
        /// The version found on the wire.
        found: u32,
        /// The version this build supports.
        expected: u32,
    },

    /// A CRDT/recorder message failed to parse or had an unknown tag.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A write was rejected by middleware or an interceptor.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// An async mutation (optimistic update, query fetch, transition
    /// handler) failed; the original error message is preserved.
    #[error("operation failed: {0}")]
    Failed(String),
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;
