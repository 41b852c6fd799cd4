//! Topology error types.

use crate::stage::StageId;

/// Errors from topology construction and stage lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// A stage ID does not refer to a stage in this topology.
    #[error("stage not found: {0}")]
    StageNotFound(StageId),

    /// No queue is registered under the given name.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// A stage with the same name already exists.
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    /// A queue with the same name already exists.
    #[error("duplicate queue name: {0}")]
    DuplicateQueue(String),

    /// A stage was connected to itself.
    #[error("stage '{0}' cannot listen to itself")]
    SelfLoop(String),

    /// The topology has no stages.
    #[error("empty topology: no stages")]
    EmptyTopology,

    /// No stage has been marked as a source.
    #[error("no source stages marked")]
    NoSources,

    /// A lifecycle hook returned an error or panicked.
    #[error("stage '{stage}' failed in {hook}: {message}")]
    HookFailed {
        /// Stage name.
        stage: String,
        /// Hook that failed (`initialize` or `finalize`).
        hook: String,
        /// Failure message.
        message: String,
    },
}
