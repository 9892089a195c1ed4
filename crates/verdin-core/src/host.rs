//! The host interface
//!
//! `SimHost` is the downcall surface between the scheduling engine and
//! the simulator that owns the clock, the machines and the ground-truth
//! task state. The engine works through this interface ONLY - never
//! concrete simulator types.
//!
//! Every snapshot returned here is valid only for the duration of the
//! upcall that requested it. Mutating calls return `Result` so the
//! engine can recover from precondition violations at the call site;
//! state-change requests are fire-and-forget and acknowledged later via
//! the `StateChangeComplete` upcall.

use crate::error::HostError;
use crate::types::{
    CpuType, MachineId, MachineInfo, MachineState, PState, Priority, SimTime, SlaClass, TaskId,
    TaskInfo, VmId, VmInfo, VmOs,
};

/// The simulator as seen from the engine.
pub trait SimHost {
    // ── Machines ────────────────────────────────────────────────────

    /// Total number of machines in the cluster. Machine ids are dense:
    /// `0..total`.
    fn machine_total(&self) -> u32;

    /// Snapshot of a machine, or `None` for an unknown id.
    fn machine_info(&self, machine: MachineId) -> Option<MachineInfo>;

    /// Request an S-state transition. Returns immediately; the new
    /// state is usable only after `StateChangeComplete`.
    fn set_machine_state(&mut self, machine: MachineId, state: MachineState)
        -> Result<(), HostError>;

    /// Set the performance state of a machine's cores. The `core`
    /// argument is accepted for interface compatibility but the change
    /// applies machine-wide.
    fn set_core_performance(
        &mut self,
        machine: MachineId,
        core: u32,
        p_state: PState,
    ) -> Result<(), HostError>;

    /// Energy consumed by one machine so far, in microjoules.
    fn machine_energy(&self, machine: MachineId) -> u64;

    /// Energy consumed by the whole cluster, in KW-Hour.
    fn cluster_energy(&self) -> f64;

    // ── VMs ─────────────────────────────────────────────────────────

    /// Allocate a detached VM. Fails if the (OS, CPU) pairing is not
    /// legal.
    fn create_vm(&mut self, os: VmOs, cpu: CpuType) -> Result<VmId, HostError>;

    /// Attach a detached VM to a running machine of matching CPU.
    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), HostError>;

    /// Place a task on an attached, non-migrating VM.
    fn add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<(), HostError>;

    /// Take a task off a VM. Used only while relocating the task; the
    /// caller re-adds it elsewhere within the same upcall.
    fn remove_task(&mut self, vm: VmId, task: TaskId) -> Result<(), HostError>;

    /// Start migrating a VM and its tasks to another running machine.
    /// Completion is signalled by the `MigrationDone` upcall.
    fn migrate_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), HostError>;

    /// Destroy a VM with no active tasks.
    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), HostError>;

    /// Snapshot of a VM, or `None` for an unknown id.
    fn vm_info(&self, vm: VmId) -> Option<VmInfo>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Total number of tasks in the workload, including those that have
    /// not arrived yet and those already completed.
    fn num_tasks(&self) -> u32;

    /// Snapshot of a task, or `None` for an unknown id.
    fn task_info(&self, task: TaskId) -> Option<TaskInfo>;

    /// Raise or lower a task's priority.
    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), HostError>;

    /// Whether the task has missed (or is doomed to miss) its target
    /// completion time.
    fn is_sla_violation(&self, task: TaskId) -> bool;

    // ── Clock and reporting ─────────────────────────────────────────

    /// Current simulated time.
    fn now(&self) -> SimTime;

    /// Percentage of tasks of the given class that violated their SLA.
    fn sla_report(&self, sla: SlaClass) -> f64;

    // ── Convenience task accessors ──────────────────────────────────

    fn task_memory(&self, task: TaskId) -> Option<u64> {
        self.task_info(task).map(|t| t.required_memory)
    }

    fn required_cpu(&self, task: TaskId) -> Option<CpuType> {
        self.task_info(task).map(|t| t.required_cpu)
    }

    fn required_os(&self, task: TaskId) -> Option<VmOs> {
        self.task_info(task).map(|t| t.required_vm)
    }

    fn required_sla(&self, task: TaskId) -> Option<SlaClass> {
        self.task_info(task).map(|t| t.required_sla)
    }

    fn task_priority(&self, task: TaskId) -> Option<Priority> {
        self.task_info(task).map(|t| t.priority)
    }

    fn is_task_completed(&self, task: TaskId) -> bool {
        self.task_info(task).map(|t| t.completed).unwrap_or(false)
    }

    fn is_task_gpu_capable(&self, task: TaskId) -> bool {
        self.task_info(task).map(|t| t.gpu_capable).unwrap_or(false)
    }
}
