//! Error types for the engine

use thiserror::Error;
use verdin_core::{HostError, MachineId, TaskId, VmId};

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can escape an upcall handler.
///
/// Recoverable downcall failures never surface here - the adapter and
/// the policies absorb them. What remains is the fatal kind: the
/// engine's shadow state disagreeing with the simulator's ground truth.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine's shadow state diverged from the simulator.
    #[error("engine invariant broken: {0}")]
    InvariantBroken(String),

    /// The simulator referenced a machine the engine never saw at init.
    #[error("unknown machine {0}")]
    UnknownMachine(MachineId),

    /// The simulator referenced a VM the engine does not own.
    #[error("unknown vm {0}")]
    UnknownVm(VmId),

    /// An upcall named a task the host cannot resolve.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// A downcall failed where the engine's own shadow state said it
    /// could not. Carries the host's reason as the diagnostic.
    #[error("host rejected a downcall the shadow state allowed: {0}")]
    ShadowDiverged(#[from] HostError),
}

impl EngineError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantBroken(msg.into())
    }
}
