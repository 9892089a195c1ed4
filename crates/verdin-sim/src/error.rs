//! Error types for the simulator

use thiserror::Error;

/// Errors surfaced by simulation setup or a run.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("cluster has no machines")]
    EmptyCluster,

    #[error("workload is empty")]
    EmptyWorkload,

    #[error("task {index} pairs {os:?} with {cpu:?}, which no machine can host")]
    IllegalWorkloadPairing {
        index: usize,
        os: verdin_core::VmOs,
        cpu: verdin_core::CpuType,
    },

    #[error(transparent)]
    Engine(#[from] verdin_engine::EngineError),
}
