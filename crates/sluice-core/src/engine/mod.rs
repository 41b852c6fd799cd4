//! # Engine
//!
//! The execution side of sluice: a [`Scheduler`] that hands stages to
//! workers, the worker thread loop, and the [`Controller`] that owns the
//! worker pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  run / scale / stop   ┌──────────────────────────────┐
//! │ Controller │ ────────────────────▶ │ worker 0 │ worker 1 │ ...    │
//! └────────────┘                       └────┬─────────────────────────┘
//!        │ summaries                        │ next_stage_for(prev, result)
//!        ▼                                  ▼
//! ┌────────────┐                      ┌───────────┐   lock   ┌──────────┐
//! │  metrics   │ ◀──── counters ───── │ Scheduler │ ───────▶ │ Topology │
//! └────────────┘                      └───────────┘          └──────────┘
//! ```
//!
//! Workers never touch scheduling status directly. Every assignment and
//! release goes through the scheduler, which applies it under the topology
//! lock together with the settle cascade.

mod controller;
mod scheduler;
mod worker;

pub use controller::Controller;
pub use scheduler::{Fairness, Scheduler};

use crate::topology::TopologyError;

/// Errors from worker pool lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    /// `run` was called twice.
    #[error("controller is already running")]
    AlreadyRunning,

    /// The operation needs a running worker pool.
    #[error("controller is not running")]
    NotRunning,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker {worker_id}: {message}")]
    SpawnFailed {
        /// Worker that failed to start.
        worker_id: usize,
        /// OS error message.
        message: String,
    },

    /// A worker thread panicked outside of stage code.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanicked {
        /// Worker that panicked.
        worker_id: usize,
        /// Panic message.
        message: String,
    },

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A topology operation failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}
