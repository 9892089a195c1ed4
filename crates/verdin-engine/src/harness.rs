//! Test host
//!
//! A hand-cranked `SimHost` for unit tests: downcalls validate and
//! apply instantly, but asynchronous effects (state transitions,
//! migrations, completions) sit parked until the test releases them and
//! feeds the matching upcall to the engine. That makes the deferred
//! paths - pending attachments, in-flight migrations - easy to pin
//! down.

use std::collections::HashMap;

use verdin_core::{
    CpuType, HostError, MachineId, MachineInfo, MachineState, PState, Priority, SimHost, SimTime,
    SlaClass, TaskId, TaskInfo, VmId, VmInfo, VmOs,
};

const DEFAULT_MEMORY: u64 = 16_384;
const DEFAULT_CORES: u32 = 8;
const DEFAULT_MIPS: [u32; 4] = [3000, 2400, 1800, 1000];
const DEFAULT_S_POWER: [u32; 7] = [120, 100, 80, 60, 40, 20, 0];
const DEFAULT_P_POWER: [u32; 4] = [160, 120, 80, 40];

#[derive(Debug, Clone)]
struct HostMachine {
    cpu: CpuType,
    cores: u32,
    memory: u64,
    memory_used: u64,
    gpu: bool,
    s_state: MachineState,
    pending: Option<MachineState>,
    p_state: PState,
    vms: Vec<VmId>,
}

#[derive(Debug, Clone)]
struct HostVm {
    os: VmOs,
    cpu: CpuType,
    machine: Option<MachineId>,
    tasks: Vec<TaskId>,
    migrating: bool,
    migration_target: Option<MachineId>,
}

/// Task parameters for the fake host.
#[derive(Debug, Clone)]
pub struct FakeTask {
    pub cpu: CpuType,
    pub os: VmOs,
    pub sla: SlaClass,
    pub memory: u64,
    pub arrival: SimTime,
    pub target_completion: SimTime,
    pub instructions: u64,
    pub gpu_capable: bool,
}

impl Default for FakeTask {
    fn default() -> Self {
        FakeTask {
            cpu: CpuType::X86,
            os: VmOs::Linux,
            sla: SlaClass::Sla1,
            memory: 2048,
            arrival: 0,
            target_completion: 10_000_000,
            instructions: 3_000_000,
            gpu_capable: false,
        }
    }
}

#[derive(Debug, Clone)]
struct HostTask {
    spec: FakeTask,
    completed: bool,
    priority: Priority,
    assigned_vm: Option<VmId>,
}

/// Scriptable host for engine unit tests.
#[derive(Debug, Default)]
pub struct FakeHost {
    machines: Vec<HostMachine>,
    vms: HashMap<VmId, HostVm>,
    next_vm: u32,
    tasks: Vec<HostTask>,
    now: SimTime,
    energy_kwh: f64,
}

pub struct FakeHostBuilder {
    host: FakeHost,
    gpu_next: bool,
}

impl FakeHost {
    pub fn builder() -> FakeHostBuilder {
        FakeHostBuilder {
            host: FakeHost::default(),
            gpu_next: false,
        }
    }

    pub fn set_now(&mut self, now: SimTime) {
        self.now = now;
    }

    pub fn set_energy_kwh(&mut self, energy: f64) {
        self.energy_kwh = energy;
    }

    /// Land a requested S-state transition. The test should follow up
    /// with `Engine::handle_state_change_complete`.
    pub fn complete_transition(&mut self, machine: MachineId) {
        let m = &mut self.machines[machine.0 as usize];
        if let Some(target) = m.pending.take() {
            m.s_state = target;
        }
    }

    /// Land an in-flight migration. The test should follow up with
    /// `Engine::handle_migration_done`.
    pub fn complete_migration(&mut self, vm: VmId) {
        let Some(v) = self.vms.get_mut(&vm) else {
            return;
        };
        let Some(dest) = v.migration_target.take() else {
            return;
        };
        let src = v.machine.take();
        v.machine = Some(dest);
        v.migrating = false;
        let moved: u64 = v
            .tasks
            .iter()
            .map(|t| self.tasks[t.0 as usize].spec.memory)
            .sum();
        if let Some(src) = src {
            let m = &mut self.machines[src.0 as usize];
            m.vms.retain(|&x| x != vm);
            m.memory_used = m.memory_used.saturating_sub(moved);
        }
        let d = &mut self.machines[dest.0 as usize];
        d.vms.push(vm);
        d.memory_used += moved;
    }

    /// Mark a task finished and free its memory. The test should follow
    /// up with `Engine::handle_task_completion`.
    pub fn complete_task(&mut self, task: TaskId) {
        let entry = &mut self.tasks[task.0 as usize];
        entry.completed = true;
        let memory = entry.spec.memory;
        if let Some(vm) = entry.assigned_vm.take() {
            if let Some(v) = self.vms.get_mut(&vm) {
                v.tasks.retain(|&t| t != task);
                if let Some(machine) = v.machine {
                    let m = &mut self.machines[machine.0 as usize];
                    m.memory_used = m.memory_used.saturating_sub(memory);
                }
            }
        }
    }

    pub fn machine_state(&self, machine: MachineId) -> MachineState {
        self.machines[machine.0 as usize].s_state
    }

    pub fn machine_pending(&self, machine: MachineId) -> Option<MachineState> {
        self.machines[machine.0 as usize].pending
    }

    pub fn machine_memory_used(&self, machine: MachineId) -> u64 {
        self.machines[machine.0 as usize].memory_used
    }

    pub fn machine_p_state(&self, machine: MachineId) -> PState {
        self.machines[machine.0 as usize].p_state
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    pub fn vm_machine(&self, vm: VmId) -> Option<MachineId> {
        self.vms.get(&vm).and_then(|v| v.machine)
    }

    pub fn task_assigned_vm(&self, task: TaskId) -> Option<VmId> {
        self.tasks[task.0 as usize].assigned_vm
    }

    pub fn stored_priority(&self, task: TaskId) -> Priority {
        self.tasks[task.0 as usize].priority
    }
}

impl FakeHostBuilder {
    /// Add `count` identical machines of one CPU family.
    pub fn machines(mut self, count: u32, cpu: CpuType) -> Self {
        for _ in 0..count {
            self.host.machines.push(HostMachine {
                cpu,
                cores: DEFAULT_CORES,
                memory: DEFAULT_MEMORY,
                memory_used: 0,
                gpu: self.gpu_next,
                s_state: MachineState::S0,
                pending: None,
                p_state: PState::P1,
                vms: Vec::new(),
            });
        }
        self.gpu_next = false;
        self
    }

    /// The next `machines()` call adds GPU-equipped machines.
    pub fn with_gpu(mut self) -> Self {
        self.gpu_next = true;
        self
    }

    /// Start the most recently added machine in the given S-state.
    pub fn last_machine_state(mut self, state: MachineState) -> Self {
        if let Some(m) = self.host.machines.last_mut() {
            m.s_state = state;
        }
        self
    }

    /// Register a task. Ids are handed out in call order from zero.
    pub fn task(mut self, spec: FakeTask) -> Self {
        self.host.tasks.push(HostTask {
            priority: spec.sla.default_priority(),
            spec,
            completed: false,
            assigned_vm: None,
        });
        self
    }

    pub fn build(self) -> FakeHost {
        self.host
    }
}

impl SimHost for FakeHost {
    fn machine_total(&self) -> u32 {
        self.machines.len() as u32
    }

    fn machine_info(&self, machine: MachineId) -> Option<MachineInfo> {
        let m = self.machines.get(machine.0 as usize)?;
        Some(MachineInfo {
            machine_id: machine,
            cpu: m.cpu,
            num_cores: m.cores,
            memory_size: m.memory,
            memory_used: m.memory_used,
            gpus: m.gpu,
            performance: DEFAULT_MIPS,
            s_states: DEFAULT_S_POWER,
            p_states: DEFAULT_P_POWER,
            s_state: m.s_state,
            p_state: m.p_state,
            energy_consumed: 0,
            active_tasks: m
                .vms
                .iter()
                .filter_map(|vm| self.vms.get(vm))
                .map(|v| v.tasks.len() as u32)
                .sum(),
            active_vms: m.vms.len() as u32,
        })
    }

    fn set_machine_state(
        &mut self,
        machine: MachineId,
        state: MachineState,
    ) -> Result<(), HostError> {
        let m = self
            .machines
            .get_mut(machine.0 as usize)
            .ok_or(HostError::MachineNotFound(machine))?;
        if m.s_state != state {
            m.pending = Some(state);
        }
        Ok(())
    }

    fn set_core_performance(
        &mut self,
        machine: MachineId,
        _core: u32,
        p_state: PState,
    ) -> Result<(), HostError> {
        let m = self
            .machines
            .get_mut(machine.0 as usize)
            .ok_or(HostError::MachineNotFound(machine))?;
        m.p_state = p_state;
        Ok(())
    }

    fn machine_energy(&self, _machine: MachineId) -> u64 {
        0
    }

    fn cluster_energy(&self) -> f64 {
        self.energy_kwh
    }

    fn create_vm(&mut self, os: VmOs, cpu: CpuType) -> Result<VmId, HostError> {
        if !os.supported_on(cpu) {
            return Err(HostError::UnsupportedPairing { os, cpu });
        }
        let id = VmId(self.next_vm);
        self.next_vm += 1;
        self.vms.insert(
            id,
            HostVm {
                os,
                cpu,
                machine: None,
                tasks: Vec::new(),
                migrating: false,
                migration_target: None,
            },
        );
        Ok(id)
    }

    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), HostError> {
        let m = self
            .machines
            .get(machine.0 as usize)
            .ok_or(HostError::MachineNotFound(machine))?;
        if m.s_state != MachineState::S0 || m.pending.is_some() {
            return Err(HostError::NotRunning(machine));
        }
        let v = self.vms.get_mut(&vm).ok_or(HostError::VmNotFound(vm))?;
        if v.machine.is_some() {
            return Err(HostError::AlreadyAttached(vm));
        }
        if v.cpu != m.cpu {
            return Err(HostError::CpuMismatch {
                need: v.cpu,
                have: m.cpu,
            });
        }
        v.machine = Some(machine);
        self.machines[machine.0 as usize].vms.push(vm);
        Ok(())
    }

    fn add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<(), HostError> {
        let spec = self
            .tasks
            .get(task.0 as usize)
            .ok_or(HostError::TaskNotFound(task))?
            .spec
            .clone();
        let v = self.vms.get(&vm).ok_or(HostError::VmNotFound(vm))?;
        if v.migrating {
            return Err(HostError::Migrating(vm));
        }
        let machine = v.machine.ok_or(HostError::Detached(vm))?;
        if v.cpu != spec.cpu {
            return Err(HostError::CpuMismatch {
                need: spec.cpu,
                have: v.cpu,
            });
        }
        if v.os != spec.os {
            return Err(HostError::OsMismatch {
                need: spec.os,
                have: v.os,
            });
        }
        let m = &self.machines[machine.0 as usize];
        if m.s_state != MachineState::S0 || m.pending.is_some() {
            return Err(HostError::NotRunning(machine));
        }
        if m.memory_used + spec.memory > m.memory {
            return Err(HostError::InsufficientMemory {
                need: spec.memory,
                have: m.memory - m.memory_used,
            });
        }
        if self.tasks[task.0 as usize].assigned_vm.is_some() {
            return Err(HostError::AlreadyAssigned(task));
        }
        self.vms.get_mut(&vm).expect("vm checked above").tasks.push(task);
        self.machines[machine.0 as usize].memory_used += spec.memory;
        let entry = &mut self.tasks[task.0 as usize];
        entry.assigned_vm = Some(vm);
        entry.priority = priority;
        Ok(())
    }

    fn remove_task(&mut self, vm: VmId, task: TaskId) -> Result<(), HostError> {
        let v = self.vms.get_mut(&vm).ok_or(HostError::VmNotFound(vm))?;
        if v.migrating {
            return Err(HostError::Migrating(vm));
        }
        if !v.tasks.contains(&task) {
            return Err(HostError::TaskNotOnVm { task, vm });
        }
        v.tasks.retain(|&t| t != task);
        let machine = v.machine;
        let memory = self.tasks[task.0 as usize].spec.memory;
        if let Some(machine) = machine {
            let m = &mut self.machines[machine.0 as usize];
            m.memory_used = m.memory_used.saturating_sub(memory);
        }
        self.tasks[task.0 as usize].assigned_vm = None;
        Ok(())
    }

    fn migrate_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), HostError> {
        let dest = self
            .machines
            .get(machine.0 as usize)
            .ok_or(HostError::MachineNotFound(machine))?;
        if dest.s_state != MachineState::S0 || dest.pending.is_some() {
            return Err(HostError::NotRunning(machine));
        }
        let v = self.vms.get_mut(&vm).ok_or(HostError::VmNotFound(vm))?;
        if v.migrating {
            return Err(HostError::Migrating(vm));
        }
        if v.machine.is_none() {
            return Err(HostError::Detached(vm));
        }
        if v.cpu != dest.cpu {
            return Err(HostError::CpuMismatch {
                need: v.cpu,
                have: dest.cpu,
            });
        }
        v.migrating = true;
        v.migration_target = Some(machine);
        Ok(())
    }

    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), HostError> {
        let v = self.vms.get(&vm).ok_or(HostError::VmNotFound(vm))?;
        if v.migrating {
            return Err(HostError::Migrating(vm));
        }
        if !v.tasks.is_empty() {
            return Err(HostError::TasksStillActive(vm));
        }
        let machine = v.machine;
        self.vms.remove(&vm);
        if let Some(machine) = machine {
            self.machines[machine.0 as usize].vms.retain(|&x| x != vm);
        }
        Ok(())
    }

    fn vm_info(&self, vm: VmId) -> Option<VmInfo> {
        let v = self.vms.get(&vm)?;
        Some(VmInfo {
            vm_id: vm,
            vm_type: v.os,
            cpu: v.cpu,
            machine_id: v.machine,
            active_tasks: v.tasks.clone(),
            migrating: v.migrating,
        })
    }

    fn num_tasks(&self) -> u32 {
        self.tasks.len() as u32
    }

    fn task_info(&self, task: TaskId) -> Option<TaskInfo> {
        let t = self.tasks.get(task.0 as usize)?;
        Some(TaskInfo {
            task_id: task,
            required_cpu: t.spec.cpu,
            required_vm: t.spec.os,
            required_memory: t.spec.memory,
            required_sla: t.spec.sla,
            arrival: t.spec.arrival,
            target_completion: t.spec.target_completion,
            total_instructions: t.spec.instructions,
            remaining_instructions: if t.completed { 0 } else { t.spec.instructions },
            gpu_capable: t.spec.gpu_capable,
            completed: t.completed,
            priority: t.priority,
        })
    }

    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), HostError> {
        let t = self
            .tasks
            .get_mut(task.0 as usize)
            .ok_or(HostError::TaskNotFound(task))?;
        t.priority = priority;
        Ok(())
    }

    fn is_sla_violation(&self, task: TaskId) -> bool {
        self.tasks
            .get(task.0 as usize)
            .map(|t| !t.completed && self.now > t.spec.target_completion)
            .unwrap_or(false)
    }

    fn now(&self) -> SimTime {
        self.now
    }

    fn sla_report(&self, _sla: SlaClass) -> f64 {
        0.0
    }
}
