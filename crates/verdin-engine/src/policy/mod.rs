//! Scheduling policies
//!
//! A [`Policy`] is the decision core installed into the engine at
//! construction. The adapter translates upcalls into policy invocations
//! and hands each one a [`PolicyCtx`]: a borrow of the engine's tables
//! plus the host, valid for the duration of that upcall.
//!
//! The strategies:
//! - `Greedy`: first-fit on running machines, consolidate on
//!   completion, sleep drained machines
//! - `Tier`: three power tiers sized by system load
//! - `Predictive`: response-time windows drive placement and DVFS
//! - `FirstFit`: eager per-(OS, machine) VM pools, exact match first
//! - `UtilSort`: sort-by-utilization placement with hotspot migration

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use verdin_core::{
    HostError, MachineId, MachineState, Priority, SimHost, SimTime, TaskId, TaskInfo, VmId,
};

use crate::error::{EngineError, Result};
use crate::state::{EngineState, PendingAttach};
use crate::vmtable::VmShadow;

mod first_fit;
mod greedy;
mod predictive;
mod tier;
mod util_sort;

pub use first_fit::FirstFitPolicy;
pub use greedy::GreedyPolicy;
pub use predictive::PredictivePolicy;
pub use tier::TierPolicy;
pub use util_sort::UtilSortPolicy;

/// Outcome of a placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Task is running on `vm`, which is attached to `machine`.
    Assigned { vm: VmId, machine: MachineId },
    /// A machine is waking up; the task sits in the pending queue until
    /// its StateChangeComplete.
    Deferred { machine: MachineId },
    /// No compatible capacity anywhere. Retried on the next periodic
    /// check.
    Unplaceable,
}

/// Tuning shared by all policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Task ids always given HIGH priority regardless of SLA class.
    /// Workload-specific; empty by default.
    #[serde(default)]
    pub high_priority_tasks: HashSet<TaskId>,
}

impl PolicyConfig {
    /// Priority for a task: the configured override, else derived from
    /// its SLA class.
    pub fn priority_for(&self, info: &TaskInfo) -> Priority {
        if self.high_priority_tasks.contains(&info.task_id) {
            Priority::High
        } else {
            info.required_sla.default_priority()
        }
    }
}

/// Selects one of the concrete strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    Greedy,
    Tier,
    Predictive,
    FirstFit,
    UtilSort,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 5] = [
        PolicyKind::Greedy,
        PolicyKind::Tier,
        PolicyKind::Predictive,
        PolicyKind::FirstFit,
        PolicyKind::UtilSort,
    ];

    /// Instantiate the strategy with the given tuning.
    pub fn build(self, config: PolicyConfig) -> Box<dyn Policy> {
        match self {
            PolicyKind::Greedy => Box::new(GreedyPolicy::new(config)),
            PolicyKind::Tier => Box::new(TierPolicy::new(config)),
            PolicyKind::Predictive => Box::new(PredictivePolicy::new(config)),
            PolicyKind::FirstFit => Box::new(FirstFitPolicy::new(config)),
            PolicyKind::UtilSort => Box::new(UtilSortPolicy::new(config)),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "greedy" => Ok(PolicyKind::Greedy),
            "tier" | "eco" => Ok(PolicyKind::Tier),
            "predictive" => Ok(PolicyKind::Predictive),
            "firstfit" | "first-fit" => Ok(PolicyKind::FirstFit),
            "utilsort" | "util-sort" => Ok(PolicyKind::UtilSort),
            other => Err(format!("unknown policy: {other}")),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyKind::Greedy => "greedy",
            PolicyKind::Tier => "tier",
            PolicyKind::Predictive => "predictive",
            PolicyKind::FirstFit => "firstfit",
            PolicyKind::UtilSort => "utilsort",
        };
        f.write_str(name)
    }
}

/// Borrow of the engine handed to a policy for one upcall.
pub struct PolicyCtx<'a> {
    pub host: &'a mut dyn SimHost,
    pub state: &'a mut EngineState,
}

/// The decision capability.
///
/// Handlers must not suspend and must bound their downcalls; placement
/// failure is reported through [`Placement::Unplaceable`], never by
/// panicking past the adapter.
pub trait Policy {
    fn name(&self) -> &'static str;

    /// Build the initial VM population and request initial S-states.
    fn init(&mut self, ctx: &mut PolicyCtx<'_>) -> Result<()>;

    /// Decide where a newly arrived (or retried) task runs.
    fn place(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) -> Placement;

    /// React to a completion on `vm` (consolidation, power-down, DVFS).
    fn on_complete(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId, vm: VmId);

    /// Periodic maintenance.
    fn tick(&mut self, ctx: &mut PolicyCtx<'_>, now: SimTime);

    /// A task is at risk of missing its deadline.
    fn on_sla_warning(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId);

    /// The simulator asserts memory overcommit on `machine`. Default:
    /// move the lightest task somewhere cooler.
    fn on_memory_warning(&mut self, ctx: &mut PolicyCtx<'_>, machine: MachineId) {
        ctx.drain_lightest_task(machine);
    }

    /// A VM finished migrating; bookkeeping already happened in the
    /// adapter.
    fn on_migration_done(&mut self, ctx: &mut PolicyCtx<'_>, vm: VmId) {
        let _ = (ctx, vm);
    }

    /// A machine finished a state transition; the pending queue was
    /// already drained by the adapter.
    fn on_state_change(&mut self, ctx: &mut PolicyCtx<'_>, machine: MachineId) {
        let _ = (ctx, machine);
    }
}

impl<'a> PolicyCtx<'a> {
    pub fn now(&self) -> SimTime {
        self.host.now()
    }

    pub fn task(&self, task: TaskId) -> Option<TaskInfo> {
        self.host.task_info(task)
    }

    /// Whether a machine carries a GPU, by the shadow record.
    pub fn machine_has_gpu(&self, machine: MachineId) -> bool {
        self.state
            .cluster
            .machine(machine)
            .map(|m| m.gpu)
            .unwrap_or(false)
    }

    /// Candidate machines of the task's CPU family, ascending by id.
    /// GPU-capable tasks see GPU machines first; the id order still
    /// breaks ties within each group.
    pub fn machine_candidates(&self, info: &TaskInfo) -> Vec<MachineId> {
        let mut ids: Vec<MachineId> = self.state.cluster.compatible(info.required_cpu).to_vec();
        if info.gpu_capable {
            ids.sort_by_key(|&id| (!self.machine_has_gpu(id), id));
        }
        ids
    }

    /// First VM on `machine` that can take a task of this type:
    /// attached, not migrating, matching (OS, CPU). Existing VMs win
    /// over creating new ones.
    pub fn reusable_vm(
        &self,
        machine: MachineId,
        os: verdin_core::VmOs,
        cpu: verdin_core::CpuType,
    ) -> Option<VmId> {
        let m = self.state.cluster.machine(machine)?;
        m.vms
            .iter()
            .copied()
            .find(|&vm| {
                self.state
                    .vms
                    .get(vm)
                    .map(|v| v.os == os && v.cpu == cpu && !v.migrating)
                    .unwrap_or(false)
            })
    }

    /// Create a VM of the given type and attach it to `machine`. A VM
    /// that fails to attach is shut down again rather than leaked.
    pub fn create_and_attach(
        &mut self,
        os: verdin_core::VmOs,
        cpu: verdin_core::CpuType,
        machine: MachineId,
    ) -> std::result::Result<VmId, HostError> {
        {
            let m = self
                .state
                .cluster
                .machine(machine)
                .ok_or(HostError::MachineNotFound(machine))?;
            if !m.is_running() {
                return Err(HostError::NotRunning(machine));
            }
            if m.cpu != cpu {
                return Err(HostError::CpuMismatch {
                    need: cpu,
                    have: m.cpu,
                });
            }
        }
        let vm = self.host.create_vm(os, cpu)?;
        self.state.vms.insert(vm, os, cpu);
        if let Err(err) = self.host.attach_vm(vm, machine) {
            let _ = self.host.shutdown_vm(vm);
            self.state.vms.remove(vm);
            return Err(err);
        }
        if let Some(shadow) = self.state.vms.get_mut(vm) {
            shadow.machine = Some(machine);
        }
        if let Some(m) = self.state.cluster.machine_mut(machine) {
            m.vms.push(vm);
        }
        debug!(%vm, %machine, ?os, "vm created and attached");
        Ok(vm)
    }

    /// Add a task to an attached VM and update every shadow counter.
    pub fn add_to_vm(
        &mut self,
        vm: VmId,
        info: &TaskInfo,
        priority: Priority,
    ) -> std::result::Result<(), HostError> {
        if self.state.assignments.contains_key(&info.task_id) {
            return Err(HostError::AlreadyAssigned(info.task_id));
        }
        let machine = {
            let shadow = self
                .state
                .vms
                .check_can_add(vm, info.required_cpu, info.required_vm)?;
            shadow.machine.ok_or(HostError::Detached(vm))?
        };
        {
            let m = self
                .state
                .cluster
                .machine(machine)
                .ok_or(HostError::MachineNotFound(machine))?;
            if !m.is_running() {
                return Err(HostError::NotRunning(machine));
            }
            if !m.fits(info.required_memory) {
                return Err(HostError::InsufficientMemory {
                    need: info.required_memory,
                    have: m.free_memory(),
                });
            }
        }
        self.host.add_task(vm, info.task_id, priority)?;
        if let Some(shadow) = self.state.vms.get_mut(vm) {
            shadow.tasks.push(info.task_id);
        }
        if let Some(m) = self.state.cluster.machine_mut(machine) {
            m.reserved_memory += info.required_memory;
            m.mips_committed += info.mips_demand();
        }
        self.state.assignments.insert(info.task_id, vm);
        self.state.stats.tasks_placed += 1;
        Ok(())
    }

    /// Place a task on `machine`, reusing a compatible VM when one
    /// exists.
    pub fn admit(
        &mut self,
        info: &TaskInfo,
        machine: MachineId,
        priority: Priority,
    ) -> std::result::Result<Placement, HostError> {
        {
            let m = self
                .state
                .cluster
                .machine(machine)
                .ok_or(HostError::MachineNotFound(machine))?;
            if !m.is_running() {
                return Err(HostError::NotRunning(machine));
            }
            if m.cpu != info.required_cpu {
                return Err(HostError::CpuMismatch {
                    need: info.required_cpu,
                    have: m.cpu,
                });
            }
            if !m.fits(info.required_memory) {
                return Err(HostError::InsufficientMemory {
                    need: info.required_memory,
                    have: m.free_memory(),
                });
            }
        }
        let (vm, created) = match self.reusable_vm(machine, info.required_vm, info.required_cpu) {
            Some(vm) => (vm, false),
            None => (
                self.create_and_attach(info.required_vm, info.required_cpu, machine)?,
                true,
            ),
        };
        match self.add_to_vm(vm, info, priority) {
            Ok(()) => Ok(Placement::Assigned { vm, machine }),
            Err(err) => {
                if created {
                    let _ = self.retire_vm(vm);
                }
                Err(err)
            }
        }
    }

    /// Request an S-state transition and mirror the target into the
    /// shadow record. Fire-and-forget; completion arrives later.
    pub fn request_state(
        &mut self,
        machine: MachineId,
        target: MachineState,
    ) -> std::result::Result<(), HostError> {
        let already_there = {
            let m = self
                .state
                .cluster
                .machine(machine)
                .ok_or(HostError::MachineNotFound(machine))?;
            m.s_state == target && !m.transition_pending
        };
        if already_there {
            return Ok(());
        }
        self.host.set_machine_state(machine, target)?;
        if let Some(m) = self.state.cluster.machine_mut(machine) {
            m.s_state = target;
            m.transition_pending = true;
        }
        match target {
            MachineState::S0 => self.state.stats.machines_woken += 1,
            MachineState::S5 => self.state.stats.machines_slept += 1,
            _ => {}
        }
        debug!(%machine, ?target, "state transition requested");
        Ok(())
    }

    /// Wake a machine toward S0 and park the task in its pending queue.
    pub fn wake_and_defer(
        &mut self,
        info: &TaskInfo,
        machine: MachineId,
        priority: Priority,
        from_vm: Option<VmId>,
    ) -> Placement {
        if self.request_state(machine, MachineState::S0).is_err() {
            return Placement::Unplaceable;
        }
        self.state.pending.push(
            machine,
            PendingAttach {
                os: info.required_vm,
                cpu: info.required_cpu,
                task: info.task_id,
                priority,
                vm: None,
                from_vm,
            },
        );
        self.state.stats.placements_deferred += 1;
        debug!(task = %info.task_id, %machine, "placement deferred until wakeup");
        Placement::Deferred { machine }
    }

    /// Lowest-id machine of the right CPU family currently in S5 and
    /// able to hold the task once awake.
    pub fn sleeping_candidate(&self, info: &TaskInfo) -> Option<MachineId> {
        self.state
            .cluster
            .compatible(info.required_cpu)
            .iter()
            .copied()
            .find(|&id| {
                self.state
                    .cluster
                    .machine(id)
                    .map(|m| {
                        m.s_state == MachineState::S5
                            && !m.transition_pending
                            && m.memory_capacity >= info.required_memory
                    })
                    .unwrap_or(false)
            })
    }

    /// Relocate a task to another machine. The remove/add pair runs
    /// within this upcall, so the move is atomic from the simulator's
    /// point of view.
    pub fn move_task(
        &mut self,
        task: TaskId,
        to_machine: MachineId,
        priority: Priority,
    ) -> std::result::Result<(), HostError> {
        let info = self.host.task_info(task).ok_or(HostError::TaskNotFound(task))?;
        let src_vm = self
            .state
            .vm_of(task)
            .ok_or(HostError::TaskNotFound(task))?;
        let src_machine = {
            let shadow = self.state.vms.get(src_vm).ok_or(HostError::VmNotFound(src_vm))?;
            if shadow.migrating {
                return Err(HostError::Migrating(src_vm));
            }
            shadow.machine.ok_or(HostError::Detached(src_vm))?
        };
        if src_machine == to_machine {
            return Ok(());
        }
        // Pick or build the destination VM before touching the source.
        {
            let m = self
                .state
                .cluster
                .machine(to_machine)
                .ok_or(HostError::MachineNotFound(to_machine))?;
            if !m.is_running() {
                return Err(HostError::NotRunning(to_machine));
            }
            if m.cpu != info.required_cpu {
                return Err(HostError::CpuMismatch {
                    need: info.required_cpu,
                    have: m.cpu,
                });
            }
            if !m.fits(info.required_memory) {
                return Err(HostError::InsufficientMemory {
                    need: info.required_memory,
                    have: m.free_memory(),
                });
            }
        }
        let dest_vm = match self.reusable_vm(to_machine, info.required_vm, info.required_cpu) {
            Some(vm) => vm,
            None => self.create_and_attach(info.required_vm, info.required_cpu, to_machine)?,
        };

        self.host.remove_task(src_vm, task)?;
        if let Some(shadow) = self.state.vms.get_mut(src_vm) {
            shadow.tasks.retain(|&t| t != task);
        }
        if let Some(m) = self.state.cluster.machine_mut(src_machine) {
            m.reserved_memory = m.reserved_memory.saturating_sub(info.required_memory);
            m.mips_committed = m.mips_committed.saturating_sub(info.mips_demand());
        }
        self.state.assignments.remove(&task);

        match self.add_to_vm(dest_vm, &info, priority) {
            Ok(()) => {
                self.state.stats.migrations_started += 1;
                self.state.stats.migrations_completed += 1;
                debug!(%task, from = %src_machine, to = %to_machine, "task relocated");
                Ok(())
            }
            Err(err) => {
                // Put the task back where it was; the host accepted it
                // there moments ago.
                if self.host.add_task(src_vm, task, priority).is_ok() {
                    if let Some(shadow) = self.state.vms.get_mut(src_vm) {
                        shadow.tasks.push(task);
                    }
                    if let Some(m) = self.state.cluster.machine_mut(src_machine) {
                        m.reserved_memory += info.required_memory;
                        m.mips_committed += info.mips_demand();
                    }
                    self.state.assignments.insert(task, src_vm);
                } else {
                    warn!(%task, "task restore after failed relocation was rejected");
                }
                Err(err)
            }
        }
    }

    /// Resident memory and committed MIPS of a VM's active tasks.
    pub fn vm_footprint(&self, vm: VmId) -> (u64, u64) {
        let Some(shadow) = self.state.vms.get(vm) else {
            return (0, 0);
        };
        let mut memory = 0;
        let mut mips = 0;
        for &task in &shadow.tasks {
            if let Some(info) = self.host.task_info(task) {
                memory += info.required_memory;
                mips += info.mips_demand();
            }
        }
        (memory, mips)
    }

    /// Start migrating a whole VM. Shadow resource counters move to the
    /// destination immediately so later placements see the claim; the
    /// machine binding flips at MigrationDone.
    pub fn start_vm_migration(
        &mut self,
        vm: VmId,
        dest: MachineId,
    ) -> std::result::Result<(), HostError> {
        let dest_cpu = {
            let m = self
                .state
                .cluster
                .machine(dest)
                .ok_or(HostError::MachineNotFound(dest))?;
            if !m.is_running() {
                return Err(HostError::NotRunning(dest));
            }
            m.cpu
        };
        let src = {
            let shadow = self.state.vms.check_can_migrate(vm, dest_cpu)?;
            shadow.machine.ok_or(HostError::Detached(vm))?
        };
        if src == dest {
            return Ok(());
        }
        let (memory, mips) = self.vm_footprint(vm);
        {
            let m = self
                .state
                .cluster
                .machine(dest)
                .ok_or(HostError::MachineNotFound(dest))?;
            if !m.fits(memory) {
                return Err(HostError::InsufficientMemory {
                    need: memory,
                    have: m.free_memory(),
                });
            }
        }
        self.host.migrate_vm(vm, dest)?;
        if let Some(shadow) = self.state.vms.get_mut(vm) {
            shadow.migrating = true;
            shadow.migration_target = Some(dest);
        }
        if let Some(m) = self.state.cluster.machine_mut(src) {
            m.reserved_memory = m.reserved_memory.saturating_sub(memory);
            m.mips_committed = m.mips_committed.saturating_sub(mips);
        }
        if let Some(m) = self.state.cluster.machine_mut(dest) {
            m.reserved_memory += memory;
            m.mips_committed += mips;
        }
        self.state.stats.migrations_started += 1;
        debug!(%vm, from = %src, to = %dest, "vm migration started");
        Ok(())
    }

    /// Rebind a VM after MigrationDone.
    pub fn finish_vm_migration(&mut self, vm: VmId) -> Result<()> {
        let (src, dest) = {
            let shadow = self
                .state
                .vms
                .get_mut(vm)
                .ok_or(EngineError::UnknownVm(vm))?;
            let dest = shadow.migration_target.take().ok_or_else(|| {
                EngineError::invariant(format!("MigrationDone for vm {vm} with no migration"))
            })?;
            let src = shadow.machine.ok_or(EngineError::UnknownVm(vm))?;
            shadow.machine = Some(dest);
            shadow.migrating = false;
            (src, dest)
        };
        if let Some(m) = self.state.cluster.machine_mut(src) {
            m.vms.retain(|&v| v != vm);
        }
        if let Some(m) = self.state.cluster.machine_mut(dest) {
            m.vms.push(vm);
        }
        self.state.stats.migrations_completed += 1;
        debug!(%vm, from = %src, to = %dest, "vm migration complete");
        Ok(())
    }

    /// Shut down a VM with no tasks and forget it.
    pub fn retire_vm(&mut self, vm: VmId) -> std::result::Result<(), HostError> {
        self.state.vms.check_can_shutdown(vm)?;
        self.host.shutdown_vm(vm)?;
        if let Some(shadow) = self.state.vms.remove(vm) {
            if let Some(machine) = shadow.machine {
                if let Some(m) = self.state.cluster.machine_mut(machine) {
                    m.vms.retain(|&v| v != vm);
                }
            }
        }
        Ok(())
    }

    /// If a running machine carries no work, shut its VMs down and send
    /// it to S5. Returns whether the machine went to sleep.
    pub fn power_off_if_idle(&mut self, machine: MachineId) -> bool {
        let vms = {
            let Some(m) = self.state.cluster.machine(machine) else {
                return false;
            };
            if !m.is_running() || m.reserved_memory > 0 {
                return false;
            }
            m.vms.clone()
        };
        if self.state.pending.waiting_on(machine) > 0 {
            return false;
        }
        let busy = vms.iter().any(|&vm| {
            self.state
                .vms
                .get(vm)
                .map(|v| !v.is_empty() || v.migrating)
                .unwrap_or(false)
        });
        // A VM inbound from another machine also keeps this one up.
        let inbound = self
            .state
            .vms
            .iter()
            .any(|v| v.migration_target == Some(machine));
        if busy || inbound {
            return false;
        }
        for vm in vms {
            let _ = self.retire_vm(vm);
        }
        let _ = self.request_state(machine, MachineState::S5);
        true
    }

    /// Move the lightest task off an overcommitted machine, planning
    /// the destination with the drain planner.
    pub fn drain_lightest_task(&mut self, machine: MachineId) {
        let Some(m) = self.state.cluster.machine(machine) else {
            return;
        };
        let mut lightest: Option<TaskInfo> = None;
        for &vm in &m.vms {
            let Some(shadow) = self.state.vms.get(vm) else {
                continue;
            };
            if shadow.migrating {
                continue;
            }
            for &task in &shadow.tasks {
                if let Some(info) = self.host.task_info(task) {
                    let lighter = lightest
                        .as_ref()
                        .map(|cur| info.required_memory < cur.required_memory)
                        .unwrap_or(true);
                    if lighter {
                        lightest = Some(info);
                    }
                }
            }
        }
        let Some(info) = lightest else {
            return;
        };
        let destinations: Vec<&crate::cluster::MachineShadow> = self
            .state
            .cluster
            .machines()
            .filter(|m| m.id != machine)
            .collect();
        let displaced = [info.clone()];
        let plan = crate::migration::DrainPlanner::plan_optimal(&displaced, &destinations);
        let Some(&dest) = plan.get(&info.task_id) else {
            debug!(%machine, task = %info.task_id, "no drain destination available");
            return;
        };
        let priority = info.priority;
        if let Err(err) = self.move_task(info.task_id, dest, priority) {
            debug!(%machine, task = %info.task_id, %err, "drain relocation rejected");
        }
    }

    /// Apply a VM's size index to the host machine's cores.
    pub fn set_vm_size(&mut self, vm: VmId, size: u8) -> std::result::Result<(), HostError> {
        let size = size.min(VmShadow::MAX_SIZE);
        let (machine, p_state) = {
            let shadow = self.state.vms.get_mut(vm).ok_or(HostError::VmNotFound(vm))?;
            if shadow.size == size {
                return Ok(());
            }
            shadow.size = size;
            let Some(machine) = shadow.machine else {
                return Ok(());
            };
            (machine, shadow.requested_p_state())
        };
        self.host.set_core_performance(machine, 0, p_state)?;
        if let Some(m) = self.state.cluster.machine_mut(machine) {
            m.p_state = p_state;
        }
        debug!(%vm, %machine, ?p_state, "vm size applied to host cores");
        Ok(())
    }

    /// Release pending attachments for a machine that just reached S0.
    /// Entries that no longer fit fall back to the unplaced list.
    pub fn drain_pending(&mut self, machine: MachineId) -> usize {
        let entries = self.state.pending.take(machine);
        let mut placed = 0;
        for entry in entries {
            let Some(info) = self.host.task_info(entry.task) else {
                continue;
            };
            if info.completed {
                continue;
            }
            let outcome = if entry.from_vm.is_some() {
                self.move_task(entry.task, machine, entry.priority)
            } else if let Some(vm) = entry.vm {
                self.attach_then_add(vm, &info, machine, entry.priority)
            } else {
                self.admit(&info, machine, entry.priority).map(|_| ())
            };
            match outcome {
                Ok(()) => placed += 1,
                Err(err) => {
                    warn!(task = %entry.task, %machine, %err, "deferred placement failed");
                    self.state.unplaced.push(entry.task);
                }
            }
        }
        placed
    }

    fn attach_then_add(
        &mut self,
        vm: VmId,
        info: &TaskInfo,
        machine: MachineId,
        priority: Priority,
    ) -> std::result::Result<(), HostError> {
        self.host.attach_vm(vm, machine)?;
        if let Some(shadow) = self.state.vms.get_mut(vm) {
            shadow.machine = Some(machine);
        }
        if let Some(m) = self.state.cluster.machine_mut(machine) {
            m.vms.push(vm);
        }
        self.add_to_vm(vm, info, priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{FakeHost, FakeTask};
    use crate::Cluster;
    use verdin_core::{CpuType, SlaClass, VmOs};

    fn state_for(host: &FakeHost) -> EngineState {
        let mut state = EngineState::default();
        state.cluster = Cluster::discover(host).unwrap();
        state
    }

    fn two_machine_host() -> FakeHost {
        FakeHost::builder()
            .machines(2, CpuType::X86)
            .task(FakeTask {
                memory: 2048,
                ..Default::default()
            })
            .build()
    }

    #[test]
    fn test_admit_creates_vm_and_reserves_memory() {
        let mut host = two_machine_host();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let info = ctx.task(TaskId(0)).unwrap();

        let placement = ctx.admit(&info, MachineId(0), Priority::Mid).unwrap();
        assert!(matches!(
            placement,
            Placement::Assigned {
                machine: MachineId(0),
                ..
            }
        ));
        let m = ctx.state.cluster.machine(MachineId(0)).unwrap();
        assert_eq!(m.reserved_memory, 2048);
        assert_eq!(m.vms.len(), 1);
        assert_eq!(ctx.state.assignments.len(), 1);
    }

    #[test]
    fn test_admit_reuses_existing_vm() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .task(FakeTask::default())
            .task(FakeTask::default())
            .build();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };

        let info0 = ctx.task(TaskId(0)).unwrap();
        let info1 = ctx.task(TaskId(1)).unwrap();
        let first = ctx.admit(&info0, MachineId(0), Priority::Mid).unwrap();
        let second = ctx.admit(&info1, MachineId(0), Priority::Mid).unwrap();

        // Existing VM wins over creating another.
        match (first, second) {
            (Placement::Assigned { vm: a, .. }, Placement::Assigned { vm: b, .. }) => {
                assert_eq!(a, b);
            }
            other => panic!("unexpected placements: {other:?}"),
        }
        assert_eq!(ctx.state.vms.len(), 1);
    }

    #[test]
    fn test_admit_rejects_exact_overflow() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .task(FakeTask {
                memory: 16_384,
                ..Default::default()
            })
            .task(FakeTask {
                memory: 1,
                ..Default::default()
            })
            .build();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };

        // Filling memory to the byte succeeds.
        let info0 = ctx.task(TaskId(0)).unwrap();
        assert!(ctx.admit(&info0, MachineId(0), Priority::Mid).is_ok());

        // One more MB fails cleanly.
        let info1 = ctx.task(TaskId(1)).unwrap();
        let err = ctx.admit(&info1, MachineId(0), Priority::Mid).unwrap_err();
        assert!(matches!(err, HostError::InsufficientMemory { .. }));
    }

    #[test]
    fn test_task_relocation_round_trip_restores_counters() {
        let mut host = two_machine_host();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let info = ctx.task(TaskId(0)).unwrap();
        ctx.admit(&info, MachineId(0), Priority::Mid).unwrap();
        let after_place = (
            ctx.state.cluster.machine(MachineId(0)).unwrap().reserved_memory,
            ctx.state.cluster.machine(MachineId(1)).unwrap().reserved_memory,
        );

        ctx.move_task(TaskId(0), MachineId(1), Priority::Mid).unwrap();
        assert_eq!(
            ctx.state.cluster.machine(MachineId(0)).unwrap().reserved_memory,
            0
        );
        assert_eq!(
            ctx.state.cluster.machine(MachineId(1)).unwrap().reserved_memory,
            2048
        );

        ctx.move_task(TaskId(0), MachineId(0), Priority::Mid).unwrap();
        let after_return = (
            ctx.state.cluster.machine(MachineId(0)).unwrap().reserved_memory,
            ctx.state.cluster.machine(MachineId(1)).unwrap().reserved_memory,
        );
        assert_eq!(after_place, after_return);
    }

    #[test]
    fn test_vm_migration_round_trip_is_bit_identical() {
        let mut host = two_machine_host();
        let mut state = state_for(&host);
        let vm = {
            let mut ctx = PolicyCtx {
                host: &mut host,
                state: &mut state,
            };
            let info = ctx.task(TaskId(0)).unwrap();
            match ctx.admit(&info, MachineId(0), Priority::Mid).unwrap() {
                Placement::Assigned { vm, .. } => vm,
                other => panic!("unexpected placement: {other:?}"),
            }
        };
        let machine_before = state.cluster.machine(MachineId(0)).unwrap().clone();
        let vm_before = state.vms.get(vm).unwrap().clone();

        // There and back again.
        for dest in [MachineId(1), MachineId(0)] {
            {
                let mut ctx = PolicyCtx {
                    host: &mut host,
                    state: &mut state,
                };
                ctx.start_vm_migration(vm, dest).unwrap();
            }
            host.complete_migration(vm);
            let mut ctx = PolicyCtx {
                host: &mut host,
                state: &mut state,
            };
            ctx.finish_vm_migration(vm).unwrap();
        }

        assert_eq!(state.cluster.machine(MachineId(0)).unwrap(), &machine_before);
        assert_eq!(state.vms.get(vm).unwrap(), &vm_before);
    }

    #[test]
    fn test_migration_moves_counters_at_start() {
        let mut host = two_machine_host();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let info = ctx.task(TaskId(0)).unwrap();
        let vm = match ctx.admit(&info, MachineId(0), Priority::Mid).unwrap() {
            Placement::Assigned { vm, .. } => vm,
            other => panic!("unexpected placement: {other:?}"),
        };

        ctx.start_vm_migration(vm, MachineId(1)).unwrap();
        // The destination already carries the claim; the binding has
        // not flipped yet.
        assert_eq!(
            ctx.state.cluster.machine(MachineId(0)).unwrap().reserved_memory,
            0
        );
        assert_eq!(
            ctx.state.cluster.machine(MachineId(1)).unwrap().reserved_memory,
            2048
        );
        assert_eq!(ctx.state.vms.get(vm).unwrap().machine, Some(MachineId(0)));
        assert!(ctx.state.vms.get(vm).unwrap().migrating);
    }

    #[test]
    fn test_shutdown_rejected_during_migration() {
        let mut host = two_machine_host();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let info = ctx.task(TaskId(0)).unwrap();
        let vm = match ctx.admit(&info, MachineId(0), Priority::Mid).unwrap() {
            Placement::Assigned { vm, .. } => vm,
            other => panic!("unexpected placement: {other:?}"),
        };
        ctx.start_vm_migration(vm, MachineId(1)).unwrap();

        assert_eq!(ctx.retire_vm(vm).unwrap_err(), HostError::Migrating(vm));
    }

    #[test]
    fn test_add_rejected_while_migrating() {
        let mut host = FakeHost::builder()
            .machines(2, CpuType::X86)
            .task(FakeTask::default())
            .task(FakeTask::default())
            .build();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let info0 = ctx.task(TaskId(0)).unwrap();
        let vm = match ctx.admit(&info0, MachineId(0), Priority::Mid).unwrap() {
            Placement::Assigned { vm, .. } => vm,
            other => panic!("unexpected placement: {other:?}"),
        };
        ctx.start_vm_migration(vm, MachineId(1)).unwrap();

        let info1 = ctx.task(TaskId(1)).unwrap();
        let err = ctx.add_to_vm(vm, &info1, Priority::Mid).unwrap_err();
        assert_eq!(err, HostError::Migrating(vm));
    }

    #[test]
    fn test_wake_and_defer_queues_until_state_change() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .last_machine_state(verdin_core::MachineState::S5)
            .task(FakeTask::default())
            .build();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let info = ctx.task(TaskId(0)).unwrap();

        let machine = ctx.sleeping_candidate(&info).unwrap();
        let placement = ctx.wake_and_defer(&info, machine, Priority::Mid, None);
        assert_eq!(placement, Placement::Deferred { machine });
        assert_eq!(ctx.state.pending.waiting_on(machine), 1);
        // Nothing ran yet; the machine is still waking.
        assert!(ctx.state.assignments.is_empty());
    }

    #[test]
    fn test_create_vm_rejects_illegal_pairing() {
        let mut host = FakeHost::builder().machines(1, CpuType::X86).build();
        let mut state = state_for(&host);
        let mut ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let err = ctx
            .create_and_attach(VmOs::Aix, CpuType::X86, MachineId(0))
            .unwrap_err();
        assert!(matches!(err, HostError::CpuMismatch { .. } | HostError::UnsupportedPairing { .. }));
        assert_eq!(ctx.state.vms.len(), 0);
    }

    #[test]
    fn test_gpu_machines_sort_first_for_gpu_tasks() {
        let mut host = FakeHost::builder()
            .machines(2, CpuType::X86)
            .with_gpu()
            .machines(1, CpuType::X86)
            .build();
        let mut state = state_for(&host);
        let ctx = PolicyCtx {
            host: &mut host,
            state: &mut state,
        };
        let mut info = TaskInfo {
            task_id: TaskId(0),
            required_cpu: CpuType::X86,
            required_vm: VmOs::Linux,
            required_memory: 1024,
            required_sla: SlaClass::Sla2,
            arrival: 0,
            target_completion: 10_000_000,
            total_instructions: 1_000_000,
            remaining_instructions: 1_000_000,
            gpu_capable: true,
            completed: false,
            priority: Priority::Low,
        };

        // Machine 2 carries the GPU and jumps the queue; ids still
        // order the rest.
        assert_eq!(
            ctx.machine_candidates(&info),
            vec![MachineId(2), MachineId(0), MachineId(1)]
        );

        info.gpu_capable = false;
        assert_eq!(
            ctx.machine_candidates(&info),
            vec![MachineId(0), MachineId(1), MachineId(2)]
        );
    }

    #[test]
    fn test_priority_override_beats_sla_default() {
        let mut config = PolicyConfig::default();
        config.high_priority_tasks.insert(TaskId(64));

        let sla2 = TaskInfo {
            task_id: TaskId(64),
            required_cpu: CpuType::X86,
            required_vm: VmOs::Linux,
            required_memory: 100,
            required_sla: SlaClass::Sla2,
            arrival: 0,
            target_completion: 1,
            total_instructions: 1,
            remaining_instructions: 1,
            gpu_capable: false,
            completed: false,
            priority: Priority::Low,
        };
        assert_eq!(config.priority_for(&sla2), Priority::High);

        let mut other = sla2.clone();
        other.task_id = TaskId(65);
        assert_eq!(config.priority_for(&other), Priority::Low);
    }
}
