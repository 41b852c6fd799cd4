//! # `Sluice` Core
//!
//! A multi-threaded dataflow execution engine for streaming pipelines.
//!
//! Work items flow through a directed graph of stages connected by bounded
//! queues. A pool of OS worker threads drains the graph to completion while
//! honoring backpressure, partial activation and deactivation of the graph,
//! and live inspection of the topology.
//!
//! This crate provides:
//! - **Queue**: Bounded, thread-safe holding area between two stages
//! - **Stage**: Graph node with a state machine, knobs and a backoff policy
//! - **Topology**: Arena of stages and queues with activation cascades
//! - **Scheduler**: Load-driven, starvation-free stage assignment
//! - **Worker**: Thread loop that executes stages and applies backoff
//! - **Controller**: Run / scale / stop lifecycle and aggregate metrics
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sluice_core::prelude::*;
//!
//! let mut topology = Topology::new();
//! let items = topology.add_queue::<u64>("items", 64)?;
//!
//! let source = topology.add_stage(
//!     "numbers",
//!     StageKind::Source,
//!     false,
//!     SourceStage::new(CountingSource::new(100), Arc::clone(&items)),
//! )?;
//! let sink = topology.add_stage(
//!     "printer",
//!     StageKind::Sink,
//!     true,
//!     SinkStage::new(items).with_processor(|n: &u64| {
//!         println!("{n}");
//!         Ok(())
//!     }),
//! )?;
//! topology.connect(source, sink)?;
//! topology.mark_source(source)?;
//! topology.mark_sink(sink)?;
//!
//! let controller = Controller::new(topology, EngineConfig::default())?;
//! controller.run(4)?;
//! controller.wait_until_finished();
//! controller.wait_until_stopped()?;
//! ```
//!
//! ## Design Principles
//!
//! 1. **Arena ownership** - The topology owns every stage and queue; graph
//!    edges are stage indices, never pointers
//! 2. **Two lock domains** - Stage knobs are stage-local, scheduling status is
//!    graph-global and guarded by the topology lock
//! 3. **Failure containment** - Stage errors and panics stop at the worker
//!    boundary and surface through the controller
//! 4. **Cooperative cancellation** - Stopping never interrupts an `execute`
//!    and never discards queued items

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod stage;
pub mod stages;
pub mod topology;

pub use config::{ConfigError, EngineConfig, EngineConfigBuilder, Parameters};
pub use engine::{Controller, ControllerError, Fairness, Scheduler};
pub use queue::{PushResult, StageQueue};
pub use stage::{
    BackoffStrategy, ExecutionResult, StageContext, StageError, StageId, StageKind, StageLogic,
    StageState,
};
pub use topology::{Topology, TopologyError};

/// Commonly used types, for glob import.
pub mod prelude {
    pub use crate::config::{EngineConfig, Parameters};
    pub use crate::engine::{Controller, Fairness};
    pub use crate::metrics::{StageSummary, TopologySummary, WorkerSummary};
    pub use crate::pool::ItemPool;
    pub use crate::queue::{PushResult, StageQueue};
    pub use crate::stage::{
        BackoffStrategy, ExecutionResult, StageContext, StageError, StageId, StageKind,
        StageLogic, StageState,
    };
    pub use crate::stages::{
        CountingSource, FnStage, GroupStage, ItemSource, MapStage, Processor, SinkStage,
        SourcePoll, SourceStage, SplitProgress, SplitStage, Splitter,
    };
    pub use crate::topology::Topology;
}

/// Result type for sluice-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sluice-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Topology construction or lifecycle errors
    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    /// Worker pool lifecycle errors
    #[error("Controller error: {0}")]
    Controller(#[from] engine::ControllerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// A stage reported a failure
    #[error("Stage error: {0}")]
    Stage(#[from] stage::StageError),
}
