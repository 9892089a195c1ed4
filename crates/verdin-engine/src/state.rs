//! Mutable engine state
//!
//! Everything the engine remembers between upcalls lives here: the
//! cluster shadow, the VM table, the task-to-VM assignment map, the
//! pending-attachment queues and the unplaced-task retry list. Created
//! at Init, torn down at SimulationComplete.

use std::collections::HashMap;

use verdin_core::{CpuType, MachineId, Priority, TaskId, VmId, VmOs};

use crate::cluster::Cluster;
use crate::stats::Instrumentation;
use crate::vmtable::VmTable;

/// A deferred placement waiting for a machine to reach S0.
///
/// `vm` names a pre-created VM to attach once the machine wakes; when
/// `None`, the drain creates one. `from_vm` marks a task relocation:
/// the task is removed from that VM before being added to the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttach {
    pub os: VmOs,
    pub cpu: CpuType,
    pub task: TaskId,
    pub priority: Priority,
    pub vm: Option<VmId>,
    pub from_vm: Option<VmId>,
}

/// Pending attachments keyed by the machine whose StateChangeComplete
/// will release them.
#[derive(Debug, Default)]
pub struct PendingQueues {
    by_machine: HashMap<MachineId, Vec<PendingAttach>>,
}

impl PendingQueues {
    pub fn push(&mut self, machine: MachineId, entry: PendingAttach) {
        self.by_machine.entry(machine).or_default().push(entry);
    }

    /// Take everything queued for `machine`, in arrival order.
    pub fn take(&mut self, machine: MachineId) -> Vec<PendingAttach> {
        self.by_machine.remove(&machine).unwrap_or_default()
    }

    pub fn waiting_on(&self, machine: MachineId) -> usize {
        self.by_machine.get(&machine).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.by_machine.values().all(Vec::is_empty)
    }

    /// Total queued entries across all machines.
    pub fn len(&self) -> usize {
        self.by_machine.values().map(Vec::len).sum()
    }
}

/// The engine's private state.
#[derive(Debug, Default)]
pub struct EngineState {
    pub cluster: Cluster,
    pub vms: VmTable,
    /// Active task -> owning VM. Exactly one entry per task between its
    /// NewTask and TaskComplete.
    pub assignments: HashMap<TaskId, VmId>,
    pub pending: PendingQueues,
    /// Tasks that found no placement; retried on the next periodic
    /// check.
    pub unplaced: Vec<TaskId>,
    pub stats: Instrumentation,
}

impl EngineState {
    /// VM currently owning a task, if the engine placed it.
    pub fn vm_of(&self, task: TaskId) -> Option<VmId> {
        self.assignments.get(&task).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task: u32) -> PendingAttach {
        PendingAttach {
            os: VmOs::Linux,
            cpu: CpuType::X86,
            task: TaskId(task),
            priority: Priority::Mid,
            vm: None,
            from_vm: None,
        }
    }

    #[test]
    fn test_pending_queue_preserves_order() {
        let mut queues = PendingQueues::default();
        queues.push(MachineId(3), entry(1));
        queues.push(MachineId(3), entry(2));
        queues.push(MachineId(4), entry(3));

        assert_eq!(queues.len(), 3);
        assert_eq!(queues.waiting_on(MachineId(3)), 2);

        let drained = queues.take(MachineId(3));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].task, TaskId(1));
        assert_eq!(drained[1].task, TaskId(2));
        assert_eq!(queues.waiting_on(MachineId(3)), 0);
        assert_eq!(queues.len(), 1);
    }

    #[test]
    fn test_take_on_empty_machine_is_empty() {
        let mut queues = PendingQueues::default();
        assert!(queues.take(MachineId(0)).is_empty());
        assert!(queues.is_empty());
    }
}
