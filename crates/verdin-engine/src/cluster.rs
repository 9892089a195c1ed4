//! Cluster shadow model
//!
//! The engine never trusts live simulator state between upcalls, so it
//! keeps its own record per machine: capabilities read once at init,
//! the last requested S/P state, and shadow resource counters updated
//! on every placement decision. The simulator's ground truth is read
//! for validation only.

use std::collections::HashMap;

use tracing::trace;
use verdin_core::{CpuType, MachineId, MachineInfo, MachineState, PState, SimHost, VmId};

use crate::error::{EngineError, Result};

/// Engine-side record of one physical machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineShadow {
    pub id: MachineId,
    pub cpu: CpuType,
    pub cores: u32,
    /// Memory capacity in MB
    pub memory_capacity: u64,
    pub gpu: bool,
    /// Per-core MIPS at P0..P3
    pub performance: [u32; 4],
    /// Last requested S-state. Reflects the target of an in-flight
    /// transition; `transition_pending` says whether it has landed.
    pub s_state: MachineState,
    pub transition_pending: bool,
    pub p_state: PState,
    /// Memory reserved by the engine's placements, in MB
    pub reserved_memory: u64,
    /// MIPS demand committed by the engine's placements
    pub mips_committed: u64,
    /// VMs the engine attached here
    pub vms: Vec<VmId>,
}

impl MachineShadow {
    fn from_info(info: &MachineInfo) -> Self {
        MachineShadow {
            id: info.machine_id,
            cpu: info.cpu,
            cores: info.num_cores,
            memory_capacity: info.memory_size,
            gpu: info.gpus,
            performance: info.performance,
            s_state: info.s_state,
            transition_pending: false,
            p_state: info.p_state,
            reserved_memory: 0,
            mips_committed: 0,
            vms: Vec::new(),
        }
    }

    /// MB not yet reserved by the engine.
    pub fn free_memory(&self) -> u64 {
        self.memory_capacity.saturating_sub(self.reserved_memory)
    }

    /// Memory utilization in [0, 1+] based on the shadow counter.
    pub fn mem_utilization(&self) -> f64 {
        if self.memory_capacity == 0 {
            return 0.0;
        }
        self.reserved_memory as f64 / self.memory_capacity as f64
    }

    /// MIPS utilization at the current P-state.
    pub fn cpu_utilization(&self) -> f64 {
        let capacity = self.cores as u64 * self.performance[self.p_state.index()] as u64;
        if capacity == 0 {
            return 0.0;
        }
        self.mips_committed as f64 / capacity as f64
    }

    /// Combined utilization: the hotter of memory and CPU.
    pub fn utilization(&self) -> f64 {
        self.mem_utilization().max(self.cpu_utilization())
    }

    /// Whether the machine can take attach/add operations right now.
    pub fn is_running(&self) -> bool {
        self.s_state.is_running() && !self.transition_pending
    }

    /// Whether placing `memory` MB keeps the machine within capacity.
    pub fn fits(&self, memory: u64) -> bool {
        self.reserved_memory + memory <= self.memory_capacity
    }
}

/// Read-mostly view of the whole cluster plus the per-CPU-family
/// placement index.
#[derive(Debug, Default)]
pub struct Cluster {
    machines: Vec<MachineShadow>,
    by_cpu: HashMap<CpuType, Vec<MachineId>>,
}

impl Cluster {
    /// Enumerate the host's machines and build the shadow records and
    /// the CPU-family index. Called once from Init.
    pub fn discover(host: &dyn SimHost) -> Result<Self> {
        let total = host.machine_total();
        let mut machines = Vec::with_capacity(total as usize);
        let mut by_cpu: HashMap<CpuType, Vec<MachineId>> = HashMap::new();
        for i in 0..total {
            let id = MachineId(i);
            let info = host
                .machine_info(id)
                .ok_or(EngineError::UnknownMachine(id))?;
            by_cpu.entry(info.cpu).or_default().push(id);
            machines.push(MachineShadow::from_info(&info));
        }
        trace!(total, "cluster discovered");
        Ok(Cluster { machines, by_cpu })
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn machine(&self, id: MachineId) -> Option<&MachineShadow> {
        self.machines.get(id.0 as usize)
    }

    pub fn machine_mut(&mut self, id: MachineId) -> Option<&mut MachineShadow> {
        self.machines.get_mut(id.0 as usize)
    }

    /// Machines in ascending id order.
    pub fn machines(&self) -> impl Iterator<Item = &MachineShadow> {
        self.machines.iter()
    }

    pub fn machines_mut(&mut self) -> impl Iterator<Item = &mut MachineShadow> {
        self.machines.iter_mut()
    }

    /// Machine ids of one CPU family, ascending.
    pub fn compatible(&self, cpu: CpuType) -> &[MachineId] {
        self.by_cpu.get(&cpu).map(Vec::as_slice).unwrap_or(&[])
    }

    /// System load proxy: total reserved memory over total capacity.
    pub fn system_load(&self) -> f64 {
        let capacity: u64 = self.machines.iter().map(|m| m.memory_capacity).sum();
        if capacity == 0 {
            return 0.0;
        }
        let used: u64 = self.machines.iter().map(|m| m.reserved_memory).sum();
        used as f64 / capacity as f64
    }

    /// Number of machines currently hosting at least one VM with the
    /// engine's knowledge.
    pub fn occupied_count(&self) -> usize {
        self.machines.iter().filter(|m| !m.vms.is_empty()).count()
    }
}
