//! Discrete-event simulation loop
//!
//! A min-heap of timed events drives the engine: task arrivals and
//! completions, state-change and migration completions, SLA and memory
//! warnings, and the periodic scheduler check. Events at the same
//! instant are ordered by insertion sequence, so runs are deterministic.
//! Completion and state-change events carry an epoch; an event whose
//! epoch no longer matches the entity's current epoch was invalidated
//! by a later decision (P-state change, migration, re-request) and is
//! dropped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use verdin_core::{
    CpuType, HostError, MachineId, MachineInfo, MachineState, PState, Priority, SimHost, SimTime,
    SlaClass, TaskId, TaskInfo, VmId, VmInfo, VmOs,
};
use verdin_engine::{Engine, Instrumentation, PolicyConfig, PolicyKind};

use crate::error::SimError;
use crate::machine::{ClusterSpec, SimMachine};
use crate::workload::TaskSpec;

/// Gap between SchedulerCheck upcalls.
const CHECK_INTERVAL: SimTime = 300_000;
/// Fixed part of a VM migration, microseconds.
const MIGRATION_BASE_US: SimTime = 50_000;
/// Per-MB part of a VM migration.
const MIGRATION_PER_MB_US: SimTime = 100;
/// Default cap on simulated time: one hour.
const DEFAULT_HORIZON: SimTime = 3_600_000_000;

#[derive(Debug, Clone)]
enum SimEvent {
    TaskArrival(TaskId),
    TaskCompletion { task: TaskId, epoch: u64 },
    StateChange { machine: MachineId, epoch: u64 },
    MigrationDone(VmId),
    MemoryWarning(MachineId),
    SlaWarning(TaskId),
    SchedulerCheck,
}

#[derive(Debug)]
struct TimedEvent {
    time: SimTime,
    seq: u64,
    event: SimEvent,
}

// BinaryHeap is a max-heap; invert the comparison for earliest-first,
// with the insertion sequence breaking same-instant ties.
impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for TimedEvent {}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

#[derive(Debug)]
struct SimVm {
    os: VmOs,
    cpu: CpuType,
    machine: Option<MachineId>,
    tasks: Vec<TaskId>,
    migrating: bool,
    migration_target: Option<MachineId>,
}

#[derive(Debug)]
struct SimTask {
    spec: TaskSpec,
    remaining: u64,
    last_progress: SimTime,
    vm: Option<VmId>,
    completed: bool,
    completion_time: Option<SimTime>,
    /// Bumped whenever the scheduled completion becomes invalid.
    epoch: u64,
    priority: Priority,
    sla_warned: bool,
}

/// Simulator ground truth; the engine sees it only through `SimHost`.
pub(crate) struct SimState {
    clock: SimTime,
    seq: u64,
    queue: BinaryHeap<TimedEvent>,
    machines: Vec<SimMachine>,
    vms: HashMap<VmId, SimVm>,
    next_vm: u32,
    tasks: Vec<SimTask>,
    horizon: SimTime,
}

impl SimState {
    fn new(cluster: &ClusterSpec, workload: &[TaskSpec], horizon: SimTime) -> Self {
        let machines = cluster
            .machine_specs()
            .into_iter()
            .map(SimMachine::new)
            .collect();
        let tasks = workload
            .iter()
            .map(|spec| SimTask {
                remaining: spec.instructions,
                last_progress: spec.arrival,
                vm: None,
                completed: false,
                completion_time: None,
                epoch: 0,
                priority: spec.sla.default_priority(),
                sla_warned: false,
                spec: spec.clone(),
            })
            .collect();
        SimState {
            clock: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            machines,
            vms: HashMap::new(),
            next_vm: 0,
            tasks,
            horizon,
        }
    }

    fn push(&mut self, time: SimTime, event: SimEvent) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(TimedEvent { time, seq, event });
    }

    fn all_done(&self) -> bool {
        self.tasks.iter().all(|t| t.completed)
    }

    /// Whether any task is executing on the machine right now.
    fn machine_busy(&self, machine: usize) -> bool {
        self.machines[machine]
            .vms
            .iter()
            .filter_map(|vm| self.vms.get(vm))
            .any(|vm| !vm.tasks.is_empty())
    }

    fn accrue_machine(&mut self, machine: usize) {
        let busy = self.machine_busy(machine);
        self.machines[machine].accrue(self.clock, busy);
    }

    /// Machine a task is executing on, if it is placed and the host is
    /// running.
    fn execution_machine(&self, task: TaskId) -> Option<usize> {
        let vm = self.tasks[task.0 as usize].vm?;
        let machine = self.vms.get(&vm)?.machine?;
        let m = &self.machines[machine.0 as usize];
        (m.s_state == MachineState::S0).then_some(machine.0 as usize)
    }

    /// Advance a task's remaining work to the current instant.
    fn progress_task(&mut self, task: TaskId) {
        let Some(machine) = self.execution_machine(task) else {
            self.tasks[task.0 as usize].last_progress = self.clock;
            return;
        };
        let rate = self.machines[machine].mips().max(1) as u64;
        let t = &mut self.tasks[task.0 as usize];
        let elapsed = self.clock.saturating_sub(t.last_progress);
        t.remaining = t.remaining.saturating_sub(elapsed * rate);
        t.last_progress = self.clock;
    }

    /// Invalidate any scheduled completion and, if the task is running,
    /// schedule a fresh one at the current rate.
    fn reschedule_completion(&mut self, task: TaskId) {
        self.tasks[task.0 as usize].epoch += 1;
        let Some(machine) = self.execution_machine(task) else {
            return;
        };
        let rate = self.machines[machine].mips().max(1) as u64;
        let t = &self.tasks[task.0 as usize];
        let eta = self.clock + t.remaining.div_ceil(rate);
        let epoch = t.epoch;
        self.push(eta, SimEvent::TaskCompletion { task, epoch });
    }

    /// Land a completion: progress is already implied by the event
    /// time. Frees memory before the engine hears about it.
    fn finish_task(&mut self, task: TaskId) {
        let (vm_id, memory) = {
            let t = &mut self.tasks[task.0 as usize];
            t.remaining = 0;
            t.completed = true;
            t.completion_time = Some(self.clock);
            (t.vm.take(), t.spec.memory_mb)
        };
        let Some(vm_id) = vm_id else {
            return;
        };
        let machine = self.vms.get(&vm_id).and_then(|v| v.machine);
        if let Some(machine) = machine {
            self.accrue_machine(machine.0 as usize);
        }
        if let Some(vm) = self.vms.get_mut(&vm_id) {
            vm.tasks.retain(|&t| t != task);
        }
        if let Some(machine) = machine {
            let m = &mut self.machines[machine.0 as usize];
            m.memory_used = m.memory_used.saturating_sub(memory);
        }
    }

    fn completion_valid(&self, task: TaskId, epoch: u64) -> bool {
        let t = &self.tasks[task.0 as usize];
        !t.completed && t.epoch == epoch && t.vm.is_some()
    }

    fn transition_valid(&self, machine: MachineId, epoch: u64) -> bool {
        let m = &self.machines[machine.0 as usize];
        m.pending_target.is_some() && m.transition_epoch == epoch
    }

    fn apply_transition(&mut self, machine: MachineId) {
        let idx = machine.0 as usize;
        self.accrue_machine(idx);
        if let Some(target) = self.machines[idx].pending_target.take() {
            self.machines[idx].s_state = target;
            debug!(%machine, ?target, "state transition landed");
        }
    }

    /// Land a migration: move memory and VM membership, re-rate the
    /// tasks. Returns the destination if it ended up overcommitted.
    fn apply_migration(&mut self, vm_id: VmId) -> Option<MachineId> {
        let (src, dest, tasks) = {
            let vm = self.vms.get(&vm_id)?;
            let dest = vm.migration_target?;
            let src = vm.machine?;
            (src, dest, vm.tasks.clone())
        };
        self.accrue_machine(src.0 as usize);
        self.accrue_machine(dest.0 as usize);
        // Bank progress at the source rate before the VM rebinds.
        for &task in &tasks {
            self.progress_task(task);
        }
        {
            let vm = self.vms.get_mut(&vm_id)?;
            vm.migration_target = None;
            vm.machine = Some(dest);
            vm.migrating = false;
        }
        let moved: u64 = tasks
            .iter()
            .map(|&t| self.tasks[t.0 as usize].spec.memory_mb)
            .sum();
        {
            let m = &mut self.machines[src.0 as usize];
            m.vms.retain(|&v| v != vm_id);
            m.memory_used = m.memory_used.saturating_sub(moved);
        }
        {
            let m = &mut self.machines[dest.0 as usize];
            m.vms.push(vm_id);
            m.memory_used += moved;
        }
        for &task in &tasks {
            self.reschedule_completion(task);
        }
        debug!(vm = %vm_id, from = %src, to = %dest, "migration landed");
        let d = &self.machines[dest.0 as usize];
        (d.memory_used > d.spec.memory_mb).then_some(dest)
    }

    /// Queue SLA warnings for tasks that burned most of their deadline
    /// budget without completing. At most one warning per task.
    fn scan_sla_warnings(&mut self) {
        let mut due = Vec::new();
        for (idx, t) in self.tasks.iter().enumerate() {
            if t.completed || t.sla_warned || t.vm.is_none() || t.spec.arrival > self.clock {
                continue;
            }
            let budget = t.spec.target_completion.saturating_sub(t.spec.arrival);
            let spent = self.clock - t.spec.arrival;
            if spent * 10 >= budget * 9 {
                due.push(TaskId(idx as u32));
            }
        }
        for task in due {
            self.tasks[task.0 as usize].sla_warned = true;
            let now = self.clock;
            self.push(now, SimEvent::SlaWarning(task));
        }
    }
}

impl SimHost for SimState {
    fn machine_total(&self) -> u32 {
        self.machines.len() as u32
    }

    fn machine_info(&self, machine: MachineId) -> Option<MachineInfo> {
        let m = self.machines.get(machine.0 as usize)?;
        Some(MachineInfo {
            machine_id: machine,
            cpu: m.spec.cpu,
            num_cores: m.spec.cores,
            memory_size: m.spec.memory_mb,
            memory_used: m.memory_used,
            gpus: m.spec.gpu,
            performance: m.spec.performance,
            s_states: m.spec.s_state_power,
            p_states: m.spec.p_state_power,
            s_state: m.s_state,
            p_state: m.p_state,
            energy_consumed: m.energy_uj as u64,
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
        let idx = machine.0 as usize;
        if idx >= self.machines.len() {
            return Err(HostError::MachineNotFound(machine));
        }
        self.accrue_machine(idx);
        let m = &mut self.machines[idx];
        let latency = SimMachine::transition_latency(m.s_state, state);
        m.pending_target = Some(state);
        m.transition_epoch += 1;
        let epoch = m.transition_epoch;
        let at = self.clock + latency;
        self.push(at, SimEvent::StateChange { machine, epoch });
        Ok(())
    }

    fn set_core_performance(
        &mut self,
        machine: MachineId,
        _core: u32,
        p_state: PState,
    ) -> Result<(), HostError> {
        let idx = machine.0 as usize;
        if idx >= self.machines.len() {
            return Err(HostError::MachineNotFound(machine));
        }
        self.accrue_machine(idx);
        // Settle progress at the old rate before the cores change
        // speed; the request applies to every core on the machine.
        let tasks: Vec<TaskId> = self.machines[idx]
            .vms
            .iter()
            .filter_map(|vm| self.vms.get(vm))
            .flat_map(|vm| vm.tasks.iter().copied())
            .collect();
        for &task in &tasks {
            self.progress_task(task);
        }
        self.machines[idx].p_state = p_state;
        for &task in &tasks {
            self.reschedule_completion(task);
        }
        Ok(())
    }

    fn machine_energy(&self, machine: MachineId) -> u64 {
        self.machines
            .get(machine.0 as usize)
            .map(|m| m.energy_uj as u64)
            .unwrap_or(0)
    }

    fn cluster_energy(&self) -> f64 {
        // 1 kWh = 3.6e12 microjoules.
        self.machines.iter().map(|m| m.energy_uj).sum::<f64>() / 3.6e12
    }

    fn create_vm(&mut self, os: VmOs, cpu: CpuType) -> Result<VmId, HostError> {
        if !os.supported_on(cpu) {
            return Err(HostError::UnsupportedPairing { os, cpu });
        }
        let id = VmId(self.next_vm);
        self.next_vm += 1;
        self.vms.insert(
            id,
            SimVm {
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
        if !m.accepts_work() {
            return Err(HostError::NotRunning(machine));
        }
        let v = self.vms.get_mut(&vm).ok_or(HostError::VmNotFound(vm))?;
        if v.machine.is_some() {
            return Err(HostError::AlreadyAttached(vm));
        }
        if v.cpu != m.spec.cpu {
            return Err(HostError::CpuMismatch {
                need: v.cpu,
                have: m.spec.cpu,
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
        if self.tasks[task.0 as usize].completed {
            return Err(HostError::TaskNotFound(task));
        }
        if self.tasks[task.0 as usize].vm.is_some() {
            return Err(HostError::AlreadyAssigned(task));
        }
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
        let idx = machine.0 as usize;
        if !self.machines[idx].accepts_work() {
            return Err(HostError::NotRunning(machine));
        }
        if self.machines[idx].memory_used + spec.memory_mb > self.machines[idx].spec.memory_mb {
            return Err(HostError::InsufficientMemory {
                need: spec.memory_mb,
                have: self.machines[idx].spec.memory_mb - self.machines[idx].memory_used,
            });
        }

        self.accrue_machine(idx);
        self.vms
            .get_mut(&vm)
            .ok_or(HostError::VmNotFound(vm))?
            .tasks
            .push(task);
        self.machines[idx].memory_used += spec.memory_mb;
        {
            let t = &mut self.tasks[task.0 as usize];
            t.vm = Some(vm);
            t.priority = priority;
            t.last_progress = self.clock;
        }
        self.reschedule_completion(task);
        trace!(%task, %vm, %machine, "task admitted");
        Ok(())
    }

    fn remove_task(&mut self, vm: VmId, task: TaskId) -> Result<(), HostError> {
        {
            let v = self.vms.get(&vm).ok_or(HostError::VmNotFound(vm))?;
            if v.migrating {
                return Err(HostError::Migrating(vm));
            }
            if !v.tasks.contains(&task) {
                return Err(HostError::TaskNotOnVm { task, vm });
            }
        }
        // Bank the work done so far, then detach.
        self.progress_task(task);
        let machine = self.vms.get(&vm).and_then(|v| v.machine);
        if let Some(machine) = machine {
            self.accrue_machine(machine.0 as usize);
        }
        if let Some(v) = self.vms.get_mut(&vm) {
            v.tasks.retain(|&t| t != task);
        }
        let memory = self.tasks[task.0 as usize].spec.memory_mb;
        if let Some(machine) = machine {
            let m = &mut self.machines[machine.0 as usize];
            m.memory_used = m.memory_used.saturating_sub(memory);
        }
        let t = &mut self.tasks[task.0 as usize];
        t.vm = None;
        t.epoch += 1;
        Ok(())
    }

    fn migrate_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), HostError> {
        let dest = self
            .machines
            .get(machine.0 as usize)
            .ok_or(HostError::MachineNotFound(machine))?;
        if !dest.accepts_work() {
            return Err(HostError::NotRunning(machine));
        }
        let dest_cpu = dest.spec.cpu;
        let resident: u64 = {
            let v = self.vms.get(&vm).ok_or(HostError::VmNotFound(vm))?;
            if v.migrating {
                return Err(HostError::Migrating(vm));
            }
            if v.machine.is_none() {
                return Err(HostError::Detached(vm));
            }
            if v.cpu != dest_cpu {
                return Err(HostError::CpuMismatch {
                    need: v.cpu,
                    have: dest_cpu,
                });
            }
            v.tasks
                .iter()
                .map(|&t| self.tasks[t.0 as usize].spec.memory_mb)
                .sum()
        };
        let v = self.vms.get_mut(&vm).ok_or(HostError::VmNotFound(vm))?;
        v.migrating = true;
        v.migration_target = Some(machine);
        let at = self.clock + MIGRATION_BASE_US + MIGRATION_PER_MB_US * resident;
        self.push(at, SimEvent::MigrationDone(vm));
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
            required_memory: t.spec.memory_mb,
            required_sla: t.spec.sla,
            arrival: t.spec.arrival,
            target_completion: t.spec.target_completion,
            total_instructions: t.spec.instructions,
            remaining_instructions: t.remaining,
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
        let Some(t) = self.tasks.get(task.0 as usize) else {
            return false;
        };
        match t.completion_time {
            Some(done) => done > t.spec.target_completion,
            None => self.clock > t.spec.target_completion,
        }
    }

    fn now(&self) -> SimTime {
        self.clock
    }

    fn sla_report(&self, sla: SlaClass) -> f64 {
        let mut total = 0u32;
        let mut violated = 0u32;
        for t in &self.tasks {
            if t.spec.sla != sla {
                continue;
            }
            total += 1;
            let missed = match t.completion_time {
                Some(done) => done > t.spec.target_completion,
                None => self.clock > t.spec.target_completion,
            };
            if missed {
                violated += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            100.0 * violated as f64 / total as f64
        }
    }
}

/// One engine wired to one simulated cluster and workload.
pub struct Simulation {
    state: SimState,
    engine: Engine,
    validate_each_event: bool,
}

/// Final figures from a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub policy: String,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    /// Violation percentages for SLA0..SLA2.
    pub sla_violation_pct: [f64; 3],
    pub total_energy_kwh: f64,
    pub finished_at_us: SimTime,
    pub stats: Instrumentation,
}

impl Simulation {
    pub fn new(
        policy: PolicyKind,
        config: PolicyConfig,
        cluster: &ClusterSpec,
        workload: &[TaskSpec],
    ) -> Result<Self, SimError> {
        if cluster.machine_specs().is_empty() {
            return Err(SimError::EmptyCluster);
        }
        if workload.is_empty() {
            return Err(SimError::EmptyWorkload);
        }
        // A task whose guest OS cannot boot on its own CPU family can
        // never run anywhere; reject the workload up front. (A merely
        // absent CPU family is a runtime placement failure, not a
        // malformed workload.)
        for (index, task) in workload.iter().enumerate() {
            if !task.os.supported_on(task.cpu) {
                return Err(SimError::IllegalWorkloadPairing {
                    index,
                    os: task.os,
                    cpu: task.cpu,
                });
            }
        }
        Ok(Simulation {
            state: SimState::new(cluster, workload, DEFAULT_HORIZON),
            engine: Engine::new(policy, config),
            validate_each_event: false,
        })
    }

    /// Cross-check engine shadow state after every event. Slow;
    /// intended for tests.
    pub fn with_validation(mut self) -> Self {
        self.validate_each_event = true;
        self
    }

    /// Cap simulated time; unfinished work past the cap counts against
    /// its SLA.
    pub fn with_horizon(mut self, horizon: SimTime) -> Self {
        self.state.horizon = horizon;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run to completion (or the horizon) and report.
    pub fn run(&mut self) -> Result<SimulationResult, SimError> {
        self.engine.init(&mut self.state)?;
        for idx in 0..self.state.tasks.len() {
            let arrival = self.state.tasks[idx].spec.arrival;
            self.state
                .push(arrival, SimEvent::TaskArrival(TaskId(idx as u32)));
        }
        self.state.push(CHECK_INTERVAL, SimEvent::SchedulerCheck);

        while let Some(ev) = self.state.queue.pop() {
            self.state.clock = ev.time;
            self.dispatch(ev)?;
            if self.validate_each_event {
                self.engine.validate(&self.state)?;
            }
        }

        for idx in 0..self.state.machines.len() {
            self.state.accrue_machine(idx);
        }
        let now = self.state.clock;
        let report = self.engine.handle_simulation_complete(&mut self.state, now)?;

        Ok(SimulationResult {
            policy: report.policy.clone(),
            total_tasks: self.state.tasks.len(),
            completed_tasks: self.state.tasks.iter().filter(|t| t.completed).count(),
            sla_violation_pct: report.sla_violations,
            total_energy_kwh: report.total_energy_kwh,
            finished_at_us: now,
            stats: report.stats,
        })
    }

    fn dispatch(&mut self, ev: TimedEvent) -> Result<(), SimError> {
        let time = ev.time;
        match ev.event {
            SimEvent::TaskArrival(task) => {
                trace!(%task, time, "arrival");
                self.engine.handle_new_task(&mut self.state, time, task)?;
            }
            SimEvent::TaskCompletion { task, epoch } => {
                if !self.state.completion_valid(task, epoch) {
                    return Ok(());
                }
                self.state.finish_task(task);
                self.engine
                    .handle_task_completion(&mut self.state, time, task)?;
            }
            SimEvent::StateChange { machine, epoch } => {
                if !self.state.transition_valid(machine, epoch) {
                    return Ok(());
                }
                self.state.apply_transition(machine);
                self.engine
                    .handle_state_change_complete(&mut self.state, time, machine)?;
            }
            SimEvent::MigrationDone(vm) => {
                let overcommitted = self.state.apply_migration(vm);
                self.engine.handle_migration_done(&mut self.state, time, vm)?;
                if let Some(machine) = overcommitted {
                    let now = self.state.clock;
                    self.state.push(now, SimEvent::MemoryWarning(machine));
                }
            }
            SimEvent::MemoryWarning(machine) => {
                self.engine
                    .handle_memory_warning(&mut self.state, time, machine)?;
            }
            SimEvent::SlaWarning(task) => {
                if !self.state.tasks[task.0 as usize].completed {
                    self.engine.handle_sla_warning(&mut self.state, time, task)?;
                }
            }
            SimEvent::SchedulerCheck => {
                self.state.scan_sla_warnings();
                self.engine.handle_periodic_check(&mut self.state, time)?;
                if !self.state.all_done() && time < self.state.horizon {
                    let next = time + CHECK_INTERVAL;
                    self.state.push(next, SimEvent::SchedulerCheck);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{generate_simple, TaskSpec};

    fn run_policy(
        policy: PolicyKind,
        cluster: &ClusterSpec,
        workload: &[TaskSpec],
    ) -> SimulationResult {
        let mut sim = Simulation::new(policy, PolicyConfig::default(), cluster, workload)
            .unwrap()
            .with_validation();
        sim.run().unwrap()
    }

    #[test]
    fn test_greedy_completes_simple_workload() {
        let cluster = ClusterSpec::uniform(8, CpuType::X86);
        let workload = generate_simple(10, CpuType::X86, 2048, 600_000_000);

        let result = run_policy(PolicyKind::Greedy, &cluster, &workload);
        assert_eq!(result.completed_tasks, 10);
        assert!(result.total_energy_kwh > 0.0);
        assert_eq!(result.sla_violation_pct, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_incompatible_cpu_reports_violation() {
        let cluster = ClusterSpec::uniform(4, CpuType::Arm);
        let workload = vec![TaskSpec {
            arrival: 0,
            instructions: 1_000_000,
            memory_mb: 2048,
            cpu: CpuType::Power,
            os: VmOs::Linux,
            sla: SlaClass::Sla1,
            gpu_capable: false,
            target_completion: 1_000_000,
        }];

        let mut sim = Simulation::new(
            PolicyKind::Greedy,
            PolicyConfig::default(),
            &cluster,
            &workload,
        )
        .unwrap()
        .with_validation()
        .with_horizon(3_000_000);
        let result = sim.run().unwrap();

        assert_eq!(result.completed_tasks, 0);
        assert_eq!(result.stats.tasks_placed, 0);
        assert!(result.stats.placement_failures >= 1);
        // The lone SLA1 task blew its deadline.
        assert_eq!(result.sla_violation_pct[1], 100.0);
    }

    #[test]
    fn test_wake_from_s5_serves_late_arrival() {
        let cluster = ClusterSpec::uniform(1, CpuType::X86);
        // Arrives after the periodic check has powered the idle
        // machine down.
        let workload = vec![TaskSpec {
            arrival: 2_000_000,
            instructions: 600_000_000,
            memory_mb: 2048,
            cpu: CpuType::X86,
            os: VmOs::Linux,
            sla: SlaClass::Sla2,
            gpu_capable: false,
            target_completion: 30_000_000,
        }];

        let result = run_policy(PolicyKind::Greedy, &cluster, &workload);
        assert_eq!(result.completed_tasks, 1);
        assert!(result.stats.machines_slept >= 1);
        assert!(result.stats.machines_woken >= 1);
        assert!(result.stats.placements_deferred >= 1);
    }

    #[test]
    fn test_tier_policy_wakes_capacity_for_burst() {
        let cluster = ClusterSpec::uniform(30, CpuType::X86);
        // 60 concurrent tasks need 15 running machines, three more
        // than the initial tier split provides.
        let workload = generate_simple(60, CpuType::X86, 4096, 2_000_000_000);

        let result = run_policy(PolicyKind::Tier, &cluster, &workload);
        assert_eq!(result.completed_tasks, 60);
        assert!(result.stats.machines_woken >= 3);
    }

    #[test]
    fn test_utilsort_migrates_off_hot_machine() {
        let cluster = ClusterSpec::uniform(2, CpuType::X86);
        let workload = vec![TaskSpec {
            arrival: 0,
            instructions: 3_000_000_000,
            memory_mb: 15_000,
            cpu: CpuType::X86,
            os: VmOs::Linux,
            sla: SlaClass::Sla2,
            gpu_capable: false,
            target_completion: 10_000_000_000,
        }];

        let result = run_policy(PolicyKind::UtilSort, &cluster, &workload);
        assert_eq!(result.completed_tasks, 1);
        assert!(result.stats.migrations_started >= 1);
        assert_eq!(result.stats.migrations_completed, result.stats.migrations_started);
    }

    #[test]
    fn test_firstfit_and_predictive_complete_mixed_workload() {
        let cluster = ClusterSpec::uniform(6, CpuType::X86);
        let workload = generate_simple(12, CpuType::X86, 2048, 500_000_000);

        for policy in [PolicyKind::FirstFit, PolicyKind::Predictive] {
            let result = run_policy(policy, &cluster, &workload);
            assert_eq!(result.completed_tasks, 12, "policy {policy} fell short");
        }
    }

    #[test]
    fn test_greedy_saves_energy_over_firstfit() {
        // Sparse arrivals over several seconds: greedy powers idle
        // machines down between tasks, first-fit keeps the whole
        // cluster at S0 with a VM pool on every machine.
        let cluster = ClusterSpec::uniform(8, CpuType::X86);
        let workload: Vec<TaskSpec> = (0..4)
            .map(|i| TaskSpec {
                arrival: i * 2_000_000,
                instructions: 600_000_000,
                memory_mb: 2048,
                cpu: CpuType::X86,
                os: VmOs::Linux,
                sla: SlaClass::Sla2,
                gpu_capable: false,
                target_completion: i * 2_000_000 + 30_000_000,
            })
            .collect();

        let greedy = run_policy(PolicyKind::Greedy, &cluster, &workload);
        let firstfit = run_policy(PolicyKind::FirstFit, &cluster, &workload);
        assert_eq!(greedy.completed_tasks, 4);
        assert_eq!(firstfit.completed_tasks, 4);
        assert!(greedy.total_energy_kwh < firstfit.total_energy_kwh);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let cluster = ClusterSpec::uniform(4, CpuType::X86);
        let workload = generate_simple(8, CpuType::X86, 2048, 400_000_000);

        let a = run_policy(PolicyKind::Greedy, &cluster, &workload);
        let b = run_policy(PolicyKind::Greedy, &cluster, &workload);
        assert_eq!(a.finished_at_us, b.finished_at_us);
        assert_eq!(a.total_energy_kwh, b.total_energy_kwh);
        assert_eq!(a.stats, b.stats);
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        let cluster = ClusterSpec::uniform(0, CpuType::X86);
        let workload = generate_simple(1, CpuType::X86, 1024, 1_000_000);
        assert!(matches!(
            Simulation::new(PolicyKind::Greedy, PolicyConfig::default(), &cluster, &workload),
            Err(SimError::EmptyCluster)
        ));

        let cluster = ClusterSpec::uniform(1, CpuType::X86);
        assert!(matches!(
            Simulation::new(PolicyKind::Greedy, PolicyConfig::default(), &cluster, &[]),
            Err(SimError::EmptyWorkload)
        ));
    }

    #[test]
    fn test_illegal_workload_pairing_is_rejected() {
        let cluster = ClusterSpec::uniform(2, CpuType::X86);
        // AIX only boots on POWER; this workload can never run.
        let workload = vec![TaskSpec {
            arrival: 0,
            instructions: 1_000_000,
            memory_mb: 1024,
            cpu: CpuType::X86,
            os: VmOs::Aix,
            sla: SlaClass::Sla2,
            gpu_capable: false,
            target_completion: 10_000_000,
        }];

        assert!(matches!(
            Simulation::new(PolicyKind::Greedy, PolicyConfig::default(), &cluster, &workload),
            Err(SimError::IllegalWorkloadPairing { index: 0, .. })
        ));
    }

    #[test]
    fn test_event_ordering_is_time_then_sequence() {
        let mut heap = BinaryHeap::new();
        heap.push(TimedEvent {
            time: 200,
            seq: 0,
            event: SimEvent::SchedulerCheck,
        });
        heap.push(TimedEvent {
            time: 100,
            seq: 2,
            event: SimEvent::SchedulerCheck,
        });
        heap.push(TimedEvent {
            time: 100,
            seq: 1,
            event: SimEvent::SchedulerCheck,
        });

        let first = heap.pop().unwrap();
        let second = heap.pop().unwrap();
        let third = heap.pop().unwrap();
        assert_eq!((first.time, first.seq), (100, 1));
        assert_eq!((second.time, second.seq), (100, 2));
        assert_eq!(third.time, 200);
    }
}
