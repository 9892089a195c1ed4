//! VM table
//!
//! Ownership and lifecycle of guest instances as the engine sees them.
//! Every mutation validates its preconditions against the shadow state
//! and returns the host's error kind on violation, so callers fall back
//! to their next candidate instead of unwinding.

use std::collections::HashMap;

use verdin_core::{CpuType, HostError, MachineId, TaskId, VmId, VmOs};

use crate::stats::ResponseWindow;

/// Engine-side record of one VM.
#[derive(Debug, Clone, PartialEq)]
pub struct VmShadow {
    pub id: VmId,
    pub os: VmOs,
    pub cpu: CpuType,
    /// Attached machine. Stays at the source during a migration and
    /// flips to the destination at MigrationDone.
    pub machine: Option<MachineId>,
    pub tasks: Vec<TaskId>,
    pub migrating: bool,
    /// Destination of an in-flight migration.
    pub migration_target: Option<MachineId>,
    /// Size index 0..=3; maps to a P-state hint on the host's cores
    /// (size 3 asks for P0).
    pub size: u8,
    /// Recent response times, fed by task completions.
    pub window: ResponseWindow,
    /// Completions observed on this VM, for cadence-based policies.
    pub completions: u64,
}

impl VmShadow {
    /// Default size index for a new VM; requests P1 on the host.
    pub const DEFAULT_SIZE: u8 = 2;
    pub const MAX_SIZE: u8 = 3;

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// P-state this VM's size asks of the host's cores.
    pub fn requested_p_state(&self) -> verdin_core::PState {
        verdin_core::PState::from_index((Self::MAX_SIZE - self.size.min(Self::MAX_SIZE)) as usize)
    }
}

/// All VMs the engine has created and not yet shut down.
#[derive(Debug, Default)]
pub struct VmTable {
    vms: HashMap<VmId, VmShadow>,
}

impl VmTable {
    /// Record a VM the host just allocated. The pairing was validated
    /// by the host; this only tracks it.
    pub fn insert(&mut self, id: VmId, os: VmOs, cpu: CpuType) -> &mut VmShadow {
        self.vms.entry(id).or_insert(VmShadow {
            id,
            os,
            cpu,
            machine: None,
            tasks: Vec::new(),
            migrating: false,
            migration_target: None,
            size: VmShadow::DEFAULT_SIZE,
            window: ResponseWindow::default(),
            completions: 0,
        })
    }

    pub fn get(&self, id: VmId) -> Option<&VmShadow> {
        self.vms.get(&id)
    }

    pub fn get_mut(&mut self, id: VmId) -> Option<&mut VmShadow> {
        self.vms.get_mut(&id)
    }

    pub fn remove(&mut self, id: VmId) -> Option<VmShadow> {
        self.vms.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// All VMs, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &VmShadow> {
        self.vms.values()
    }

    /// VM ids sorted ascending, for deterministic scans.
    pub fn ids_sorted(&self) -> Vec<VmId> {
        let mut ids: Vec<VmId> = self.vms.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Validate that `vm` may accept a task of the given type.
    pub fn check_can_add(
        &self,
        vm: VmId,
        task_cpu: CpuType,
        task_os: VmOs,
    ) -> Result<&VmShadow, HostError> {
        let shadow = self.vms.get(&vm).ok_or(HostError::VmNotFound(vm))?;
        if shadow.migrating {
            return Err(HostError::Migrating(vm));
        }
        if shadow.machine.is_none() {
            return Err(HostError::Detached(vm));
        }
        if shadow.cpu != task_cpu {
            return Err(HostError::CpuMismatch {
                need: task_cpu,
                have: shadow.cpu,
            });
        }
        if shadow.os != task_os {
            return Err(HostError::OsMismatch {
                need: task_os,
                have: shadow.os,
            });
        }
        Ok(shadow)
    }

    /// Validate that `vm` may start migrating to a machine of `cpu`.
    pub fn check_can_migrate(&self, vm: VmId, dest_cpu: CpuType) -> Result<&VmShadow, HostError> {
        let shadow = self.vms.get(&vm).ok_or(HostError::VmNotFound(vm))?;
        if shadow.migrating {
            return Err(HostError::Migrating(vm));
        }
        if shadow.machine.is_none() {
            return Err(HostError::Detached(vm));
        }
        if shadow.cpu != dest_cpu {
            return Err(HostError::CpuMismatch {
                need: shadow.cpu,
                have: dest_cpu,
            });
        }
        Ok(shadow)
    }

    /// Validate that `vm` may be shut down.
    pub fn check_can_shutdown(&self, vm: VmId) -> Result<&VmShadow, HostError> {
        let shadow = self.vms.get(&vm).ok_or(HostError::VmNotFound(vm))?;
        if shadow.migrating {
            return Err(HostError::Migrating(vm));
        }
        if !shadow.tasks.is_empty() {
            return Err(HostError::TasksStillActive(vm));
        }
        Ok(shadow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached_vm(table: &mut VmTable, id: u32) -> VmId {
        let vm = VmId(id);
        table.insert(vm, VmOs::Linux, CpuType::X86);
        table.get_mut(vm).unwrap().machine = Some(MachineId(0));
        vm
    }

    #[test]
    fn test_add_requires_attachment() {
        let mut table = VmTable::default();
        let vm = VmId(1);
        table.insert(vm, VmOs::Linux, CpuType::X86);

        let err = table
            .check_can_add(vm, CpuType::X86, VmOs::Linux)
            .unwrap_err();
        assert_eq!(err, HostError::Detached(vm));
    }

    #[test]
    fn test_add_rejected_while_migrating() {
        let mut table = VmTable::default();
        let vm = attached_vm(&mut table, 1);
        table.get_mut(vm).unwrap().migrating = true;

        let err = table
            .check_can_add(vm, CpuType::X86, VmOs::Linux)
            .unwrap_err();
        assert_eq!(err, HostError::Migrating(vm));
    }

    #[test]
    fn test_add_rejects_type_mismatches() {
        let mut table = VmTable::default();
        let vm = attached_vm(&mut table, 1);

        assert!(matches!(
            table.check_can_add(vm, CpuType::Arm, VmOs::Linux),
            Err(HostError::CpuMismatch { .. })
        ));
        assert!(matches!(
            table.check_can_add(vm, CpuType::X86, VmOs::Win),
            Err(HostError::OsMismatch { .. })
        ));
        assert!(table.check_can_add(vm, CpuType::X86, VmOs::Linux).is_ok());
    }

    #[test]
    fn test_shutdown_rejected_with_tasks_or_migration() {
        let mut table = VmTable::default();
        let vm = attached_vm(&mut table, 1);
        table.get_mut(vm).unwrap().tasks.push(TaskId(7));

        assert_eq!(
            table.check_can_shutdown(vm).unwrap_err(),
            HostError::TasksStillActive(vm)
        );

        table.get_mut(vm).unwrap().tasks.clear();
        table.get_mut(vm).unwrap().migrating = true;
        assert_eq!(
            table.check_can_shutdown(vm).unwrap_err(),
            HostError::Migrating(vm)
        );
    }

    #[test]
    fn test_size_maps_to_pstate_inverted() {
        let mut table = VmTable::default();
        let vm = attached_vm(&mut table, 1);
        let shadow = table.get_mut(vm).unwrap();

        shadow.size = 3;
        assert_eq!(shadow.requested_p_state(), verdin_core::PState::P0);
        shadow.size = 2;
        assert_eq!(shadow.requested_p_state(), verdin_core::PState::P1);
        shadow.size = 0;
        assert_eq!(shadow.requested_p_state(), verdin_core::PState::P3);
    }
}
