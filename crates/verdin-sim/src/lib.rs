//! Verdin Sim
//!
//! A discrete-event simulator for exercising the scheduling engine:
//! machines with S-state power and P-state performance tables, tasks
//! that progress at their host's MIPS, asynchronous state transitions
//! and migrations, SLA bookkeeping, and energy integration. The physics
//! are deliberately simple - this crate exists so policies can be
//! compared end-to-end, not to model hardware faithfully.

pub mod error;
pub mod machine;
pub mod simulator;
pub mod workload;

pub use error::SimError;
pub use machine::{ClusterSpec, MachineGroup, MachineSpec};
pub use simulator::{Simulation, SimulationResult};
pub use workload::{TaskSpec, WorkloadConfig, WorkloadGenerator};
