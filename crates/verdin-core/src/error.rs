//! Error types for host downcalls

use thiserror::Error;

use crate::types::{CpuType, MachineId, TaskId, VmId, VmOs};

/// Errors a host may return from a downcall.
///
/// These are precondition violations. The engine recovers from every
/// one of them locally (falls back to the next candidate, defers the
/// operation, or marks the task unplaced); none is fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("machine {0} not found")]
    MachineNotFound(MachineId),

    #[error("vm {0} not found")]
    VmNotFound(VmId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("machine {0} is not running")]
    NotRunning(MachineId),

    #[error("cpu mismatch: need {need:?}, have {have:?}")]
    CpuMismatch { need: CpuType, have: CpuType },

    #[error("guest os {os:?} is not supported on {cpu:?}")]
    UnsupportedPairing { os: VmOs, cpu: CpuType },

    #[error("os mismatch: task requires {need:?}, vm runs {have:?}")]
    OsMismatch { need: VmOs, have: VmOs },

    #[error("insufficient memory: need {need} MB, have {have} MB")]
    InsufficientMemory { need: u64, have: u64 },

    #[error("vm {0} is migrating")]
    Migrating(VmId),

    #[error("vm {0} is already attached")]
    AlreadyAttached(VmId),

    #[error("vm {0} is not attached to a machine")]
    Detached(VmId),

    #[error("vm {0} still has active tasks")]
    TasksStillActive(VmId),

    #[error("task {0} is already assigned")]
    AlreadyAssigned(TaskId),

    #[error("task {task} is not on vm {vm}")]
    TaskNotOnVm { task: TaskId, vm: VmId },
}
