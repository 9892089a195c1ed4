//! Event adapter
//!
//! Translates simulator upcalls into policy invocations and the
//! policy's decisions back into downcalls. Each handler runs to
//! completion, mutates the engine's shadow state, and issues a bounded
//! sequence of downcalls before returning. Recoverable downcall
//! failures never escape a handler; only a divergence between shadow
//! state and ground truth does.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use verdin_core::{
    MachineId, MachineState, SimHost, SimTime, SlaClass, TaskId, VmId,
};

use crate::error::{EngineError, Result};
use crate::policy::{Placement, Policy, PolicyConfig, PolicyCtx, PolicyKind};
use crate::state::EngineState;
use crate::stats::Instrumentation;
use crate::Cluster;

/// The scheduling engine: policy plus private state, driven by upcalls.
pub struct Engine {
    policy: Box<dyn Policy>,
    kind: PolicyKind,
    state: EngineState,
}

impl Engine {
    pub fn new(kind: PolicyKind, config: PolicyConfig) -> Self {
        Engine {
            policy: kind.build(config),
            kind,
            state: EngineState::default(),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn stats(&self) -> &Instrumentation {
        &self.state.stats
    }

    /// Read access to the shadow state, for inspection and tests.
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// InitScheduler: discover the cluster, build the placement index,
    /// and let the policy stand up its initial VM population.
    pub fn init(&mut self, host: &mut dyn SimHost) -> Result<()> {
        self.state.cluster = Cluster::discover(host)?;
        info!(
            policy = self.policy.name(),
            machines = self.state.cluster.len(),
            "scheduler initialized"
        );
        let Engine { policy, state, .. } = self;
        let mut ctx = PolicyCtx { host, state };
        policy.init(&mut ctx)
    }

    /// HandleNewTask: resolve metadata and ask the policy for a
    /// placement. Failure is an SLA risk, never a panic.
    pub fn handle_new_task(
        &mut self,
        host: &mut dyn SimHost,
        now: SimTime,
        task: TaskId,
    ) -> Result<()> {
        if host.task_info(task).is_none() {
            return Err(EngineError::UnknownTask(task));
        }
        let Engine { policy, state, .. } = self;
        let mut ctx = PolicyCtx { host, state };
        match policy.place(&mut ctx, task) {
            Placement::Assigned { vm, machine } => {
                debug!(%task, %vm, %machine, now, "task placed");
            }
            Placement::Deferred { machine } => {
                debug!(%task, %machine, now, "task deferred until wakeup");
            }
            Placement::Unplaceable => {
                warn!(%task, now, "no placement found; task at SLA risk");
                ctx.state.stats.placement_failures += 1;
                ctx.state.unplaced.push(task);
            }
        }
        Ok(())
    }

    /// HandleTaskCompletion: retire the assignment, feed the VM's
    /// response window, release shadow resources, then let the policy
    /// consolidate.
    pub fn handle_task_completion(
        &mut self,
        host: &mut dyn SimHost,
        now: SimTime,
        task: TaskId,
    ) -> Result<()> {
        let vm = self.state.assignments.remove(&task).ok_or_else(|| {
            EngineError::invariant(format!("completion for task {task} the engine never placed"))
        })?;
        let info = host.task_info(task).ok_or(EngineError::UnknownTask(task))?;
        let sample = now.saturating_sub(info.arrival);

        let machine = {
            let shadow = self
                .state
                .vms
                .get_mut(vm)
                .ok_or(EngineError::UnknownVm(vm))?;
            shadow.tasks.retain(|&t| t != task);
            shadow.window.record(sample);
            shadow.completions += 1;
            // A completion on a migrating VM charges the machine the
            // counters moved to at migration start.
            shadow.migration_target.or(shadow.machine)
        };
        if let Some(machine) = machine {
            if let Some(m) = self.state.cluster.machine_mut(machine) {
                m.reserved_memory = m.reserved_memory.saturating_sub(info.required_memory);
                m.mips_committed = m.mips_committed.saturating_sub(info.mips_demand());
            }
        }
        self.state.stats.tasks_completed += 1;
        debug!(%task, %vm, response_us = sample, "task complete");

        let Engine { policy, state, .. } = self;
        let mut ctx = PolicyCtx { host, state };
        policy.on_complete(&mut ctx, task, vm);
        Ok(())
    }

    /// MigrationDone: rebind the VM to its destination and clear the
    /// migrating flag.
    pub fn handle_migration_done(
        &mut self,
        host: &mut dyn SimHost,
        _now: SimTime,
        vm: VmId,
    ) -> Result<()> {
        let Engine { policy, state, .. } = self;
        let mut ctx = PolicyCtx { host, state };
        ctx.finish_vm_migration(vm)?;
        policy.on_migration_done(&mut ctx, vm);
        Ok(())
    }

    /// StateChangeComplete: land the transition in the shadow record,
    /// then drain deferred work if the machine is now running.
    pub fn handle_state_change_complete(
        &mut self,
        host: &mut dyn SimHost,
        _now: SimTime,
        machine: MachineId,
    ) -> Result<()> {
        let info = host
            .machine_info(machine)
            .ok_or(EngineError::UnknownMachine(machine))?;
        {
            let m = self
                .state
                .cluster
                .machine_mut(machine)
                .ok_or(EngineError::UnknownMachine(machine))?;
            m.transition_pending = false;
            m.s_state = info.s_state;
            m.p_state = info.p_state;
        }

        if info.s_state == MachineState::S5 {
            let busy = self
                .state
                .cluster
                .machine(machine)
                .map(|m| {
                    m.vms.iter().any(|&vm| {
                        self.state
                            .vms
                            .get(vm)
                            .map(|v| !v.is_empty())
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if busy {
                return Err(EngineError::invariant(format!(
                    "machine {machine} reached S5 with tasks still attached"
                )));
            }
        }

        let Engine { policy, state, .. } = self;
        let mut ctx = PolicyCtx { host, state };
        if info.s_state == MachineState::S0 {
            let drained = ctx.drain_pending(machine);
            if drained > 0 {
                debug!(%machine, drained, "pending attachments released");
            }
        }
        policy.on_state_change(&mut ctx, machine);
        Ok(())
    }

    /// SLAWarning: count it and hand it to the policy.
    pub fn handle_sla_warning(
        &mut self,
        host: &mut dyn SimHost,
        now: SimTime,
        task: TaskId,
    ) -> Result<()> {
        self.state.stats.sla_warnings += 1;
        debug!(%task, now, "sla warning");
        let Engine { policy, state, .. } = self;
        let mut ctx = PolicyCtx { host, state };
        policy.on_sla_warning(&mut ctx, task);
        Ok(())
    }

    /// MemoryWarning: the simulator asserts overcommit. Informational;
    /// the policy may drain the machine opportunistically.
    pub fn handle_memory_warning(
        &mut self,
        host: &mut dyn SimHost,
        now: SimTime,
        machine: MachineId,
    ) -> Result<()> {
        warn!(%machine, now, "memory overcommit reported");
        self.state.stats.memory_warnings += 1;
        let Engine { policy, state, .. } = self;
        let mut ctx = PolicyCtx { host, state };
        policy.on_memory_warning(&mut ctx, machine);
        Ok(())
    }

    /// SchedulerCheck: retry unplaced tasks, then give the policy its
    /// periodic slot.
    pub fn handle_periodic_check(&mut self, host: &mut dyn SimHost, now: SimTime) -> Result<()> {
        let Engine { policy, state, .. } = self;
        let retry = std::mem::take(&mut state.unplaced);
        let mut ctx = PolicyCtx { host, state };
        for task in retry {
            if ctx.host.is_task_completed(task) {
                continue;
            }
            match policy.place(&mut ctx, task) {
                Placement::Unplaceable => ctx.state.unplaced.push(task),
                Placement::Assigned { .. } | Placement::Deferred { .. } => {
                    debug!(%task, "retry placed");
                }
            }
        }
        policy.tick(&mut ctx, now);
        Ok(())
    }

    /// SimulationComplete: shut down every empty VM, snapshot the SLA
    /// and energy figures, and print the final report.
    pub fn handle_simulation_complete(
        &mut self,
        host: &mut dyn SimHost,
        now: SimTime,
    ) -> Result<EngineReport> {
        {
            let Engine { state, .. } = self;
            let mut ctx = PolicyCtx { host, state };
            for vm in ctx.state.vms.ids_sorted() {
                if let Err(err) = ctx.retire_vm(vm) {
                    debug!(%vm, %err, "vm left running at shutdown");
                }
            }
        }
        let report = EngineReport {
            policy: self.policy.name().to_string(),
            sla_violations: [
                host.sla_report(SlaClass::Sla0),
                host.sla_report(SlaClass::Sla1),
                host.sla_report(SlaClass::Sla2),
            ],
            total_energy_kwh: host.cluster_energy(),
            finished_at: now,
            stats: self.state.stats.clone(),
        };
        for line in report.stdout_lines() {
            println!("{line}");
        }
        info!(now, "simulation complete");
        Ok(report)
    }

    /// Cross-check the shadow state against itself and the host. Every
    /// violation here is the fatal kind.
    pub fn validate(&self, host: &dyn SimHost) -> Result<()> {
        // Attached VMs sit on running machines of their own CPU family
        // and appear in the machine's VM list.
        for vm in self.state.vms.iter() {
            if let Some(machine) = vm.machine {
                let m = self
                    .state
                    .cluster
                    .machine(machine)
                    .ok_or(EngineError::UnknownMachine(machine))?;
                if m.cpu != vm.cpu {
                    return Err(EngineError::invariant(format!(
                        "vm {} ({:?}) attached to {:?} machine {}",
                        vm.id, vm.cpu, m.cpu, machine
                    )));
                }
                if !m.s_state.is_running() {
                    return Err(EngineError::invariant(format!(
                        "vm {} attached to machine {} in {:?}",
                        vm.id, machine, m.s_state
                    )));
                }
                if !m.vms.contains(&vm.id) {
                    return Err(EngineError::invariant(format!(
                        "vm {} missing from machine {}'s vm list",
                        vm.id, machine
                    )));
                }
            } else if !vm.tasks.is_empty() {
                return Err(EngineError::invariant(format!(
                    "detached vm {} holds tasks",
                    vm.id
                )));
            }
        }

        // Assignments and VM task lists agree; no task is double-held.
        for (&task, &vm) in &self.state.assignments {
            let shadow = self
                .state
                .vms
                .get(vm)
                .ok_or(EngineError::UnknownVm(vm))?;
            if !shadow.tasks.contains(&task) {
                return Err(EngineError::invariant(format!(
                    "assignment says task {task} is on vm {vm}, vm disagrees"
                )));
            }
        }
        for vm in self.state.vms.iter() {
            for &task in &vm.tasks {
                if self.state.assignments.get(&task) != Some(&vm.id) {
                    return Err(EngineError::invariant(format!(
                        "vm {} holds task {task} without a matching assignment",
                        vm.id
                    )));
                }
            }
        }

        // Shadow memory counters reconcile with the tasks the engine
        // believes are resident. Migrating VMs charge their target.
        let mut expected_memory = vec![0u64; self.state.cluster.len()];
        for vm in self.state.vms.iter() {
            let Some(machine) = vm.migration_target.or(vm.machine) else {
                continue;
            };
            for &task in &vm.tasks {
                if let Some(info) = host.task_info(task) {
                    expected_memory[machine.0 as usize] += info.required_memory;
                }
            }
        }
        for m in self.state.cluster.machines() {
            let expected = expected_memory[m.id.0 as usize];
            if m.reserved_memory != expected {
                return Err(EngineError::invariant(format!(
                    "machine {} shadow memory {} != resident task total {}",
                    m.id, m.reserved_memory, expected
                )));
            }
            if m.reserved_memory > m.memory_capacity {
                return Err(EngineError::invariant(format!(
                    "machine {} shadow memory {} exceeds capacity {}",
                    m.id, m.reserved_memory, m.memory_capacity
                )));
            }
        }
        Ok(())
    }
}

/// Final figures emitted at SimulationComplete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub policy: String,
    /// Violation percentages for SLA0..SLA2.
    pub sla_violations: [f64; 3],
    pub total_energy_kwh: f64,
    pub finished_at: SimTime,
    pub stats: Instrumentation,
}

impl EngineReport {
    /// The report lines printed to stdout.
    pub fn stdout_lines(&self) -> Vec<String> {
        vec![
            "SLA violation report".to_string(),
            format!("SLA0: {:.2}%", self.sla_violations[0]),
            format!("SLA1: {:.2}%", self.sla_violations[1]),
            format!("SLA2: {:.2}%", self.sla_violations[2]),
            format!("Total Energy {:.3} KW-Hour", self.total_energy_kwh),
            format!(
                "Simulation run finished in {} seconds",
                self.finished_at as f64 / 1_000_000.0
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{FakeHost, FakeTask};
    use verdin_core::{CpuType, PState, Priority, SlaClass};

    fn greedy() -> Engine {
        Engine::new(PolicyKind::Greedy, PolicyConfig::default())
    }

    #[test]
    fn test_single_sla0_task_lands_on_machine_zero() {
        let mut host = FakeHost::builder()
            .machines(8, CpuType::X86)
            .task(FakeTask {
                sla: SlaClass::Sla0,
                memory: 2048,
                ..Default::default()
            })
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();

        assert_eq!(host.vm_count(), 1);
        assert_eq!(host.vm_machine(VmId(0)), Some(MachineId(0)));
        assert_eq!(host.task_assigned_vm(TaskId(0)), Some(VmId(0)));
        assert_eq!(host.stored_priority(TaskId(0)), Priority::High);
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_cpu_mismatch_fails_cleanly() {
        let mut host = FakeHost::builder()
            .machines(4, CpuType::Arm)
            .task(FakeTask {
                cpu: CpuType::Power,
                ..Default::default()
            })
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();

        assert_eq!(host.vm_count(), 0);
        assert_eq!(engine.stats().placement_failures, 1);
        assert_eq!(engine.state().unplaced, vec![TaskId(0)]);
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_wake_from_s5_runs_task_after_state_change() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .last_machine_state(MachineState::S5)
            .task(FakeTask::default())
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();

        // The machine is waking; nothing may run yet.
        assert_eq!(host.machine_pending(MachineId(0)), Some(MachineState::S0));
        assert_eq!(host.task_assigned_vm(TaskId(0)), None);
        assert_eq!(engine.state().pending.waiting_on(MachineId(0)), 1);

        host.complete_transition(MachineId(0));
        engine
            .handle_state_change_complete(&mut host, 1_000_000, MachineId(0))
            .unwrap();

        assert_eq!(host.vm_count(), 1);
        assert!(host.task_assigned_vm(TaskId(0)).is_some());
        assert_eq!(engine.state().pending.waiting_on(MachineId(0)), 0);
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_gpu_task_prefers_gpu_machine() {
        // Machine 0 has no GPU, machine 1 does; both are free.
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .with_gpu()
            .machines(1, CpuType::X86)
            .task(FakeTask {
                gpu_capable: true,
                ..Default::default()
            })
            .task(FakeTask::default())
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();

        // The GPU-capable task skips the lower-id machine for the GPU
        // host.
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();
        assert_eq!(host.vm_machine(VmId(0)), Some(MachineId(1)));

        // A plain task still takes the lowest id.
        engine.handle_new_task(&mut host, 0, TaskId(1)).unwrap();
        assert_eq!(host.vm_machine(VmId(1)), Some(MachineId(0)));
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_utilsort_breaks_utilization_ties_toward_gpu() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .with_gpu()
            .machines(1, CpuType::X86)
            .task(FakeTask {
                gpu_capable: true,
                ..Default::default()
            })
            .build();
        let mut engine = Engine::new(PolicyKind::UtilSort, PolicyConfig::default());
        engine.init(&mut host).unwrap();

        // Both machines idle at equal utilization; the GPU host wins
        // the tie for a GPU-capable task.
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();
        assert_eq!(host.vm_machine(VmId(0)), Some(MachineId(1)));
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_completion_frees_machine_then_machine_sleeps() {
        // Two chunky tasks so first-fit spreads them over two machines.
        let mut host = FakeHost::builder()
            .machines(4, CpuType::X86)
            .task(FakeTask {
                memory: 9000,
                ..Default::default()
            })
            .task(FakeTask {
                memory: 9000,
                ..Default::default()
            })
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(1)).unwrap();

        assert_eq!(host.vm_machine(VmId(0)), Some(MachineId(0)));
        assert_eq!(host.vm_machine(VmId(1)), Some(MachineId(1)));

        // Machine 1's task completes; too few busy machines for any
        // consolidation, so machine 0's task stays put.
        host.complete_task(TaskId(1));
        engine
            .handle_task_completion(&mut host, 2_000_000, TaskId(1))
            .unwrap();
        assert_eq!(host.task_assigned_vm(TaskId(0)), Some(VmId(0)));

        // The next periodic check puts the drained machine to S5.
        engine.handle_periodic_check(&mut host, 3_000_000).unwrap();
        assert_eq!(host.machine_pending(MachineId(1)), Some(MachineState::S5));
        assert_eq!(
            engine.state().cluster.machine(MachineId(1)).unwrap().s_state,
            MachineState::S5
        );
        // Machine 0 keeps its work.
        assert!(host.machine_pending(MachineId(0)).is_none());
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_sla_warning_relocates_task_and_counters() {
        let mut host = FakeHost::builder()
            .machines(2, CpuType::X86)
            .task(FakeTask {
                memory: 16_384,
                ..Default::default()
            })
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();
        assert_eq!(
            engine.state().cluster.machine(MachineId(0)).unwrap().reserved_memory,
            16_384
        );

        engine.handle_sla_warning(&mut host, 5_000_000, TaskId(0)).unwrap();

        let m0 = engine.state().cluster.machine(MachineId(0)).unwrap();
        let m1 = engine.state().cluster.machine(MachineId(1)).unwrap();
        assert_eq!(m0.reserved_memory, 0);
        assert_eq!(m1.reserved_memory, 16_384);
        assert_eq!(host.machine_memory_used(MachineId(0)), 0);
        assert_eq!(host.machine_memory_used(MachineId(1)), 16_384);
        assert_eq!(host.stored_priority(TaskId(0)), Priority::High);
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_predictive_dvfs_raises_size_then_saturates() {
        let mut builder = FakeHost::builder().machines(1, CpuType::X86);
        for _ in 0..20 {
            builder = builder.task(FakeTask {
                memory: 512,
                ..Default::default()
            });
        }
        let mut host = builder.build();
        let mut engine = Engine::new(PolicyKind::Predictive, PolicyConfig::default());
        engine.init(&mut host).unwrap();

        for i in 0..10 {
            engine.handle_new_task(&mut host, 0, TaskId(i)).unwrap();
        }
        // One VM serves everything.
        assert_eq!(host.vm_count(), 1);

        // First half answers in 100us, second half 15% slower.
        for i in 0..5 {
            host.complete_task(TaskId(i));
            engine.handle_task_completion(&mut host, 100, TaskId(i)).unwrap();
        }
        for i in 5..10 {
            host.complete_task(TaskId(i));
            engine.handle_task_completion(&mut host, 115, TaskId(i)).unwrap();
        }

        // Size stepped 2 -> 3, which asks the host for P0.
        assert_eq!(engine.state().vms.get(VmId(0)).unwrap().size, 3);
        assert_eq!(host.machine_p_state(MachineId(0)), PState::P0);

        // Another slowing window cannot push the size past the cap.
        for i in 10..20 {
            engine.handle_new_task(&mut host, 200, TaskId(i)).unwrap();
        }
        for i in 10..15 {
            host.complete_task(TaskId(i));
            engine.handle_task_completion(&mut host, 400, TaskId(i)).unwrap();
        }
        for i in 15..20 {
            host.complete_task(TaskId(i));
            engine.handle_task_completion(&mut host, 480, TaskId(i)).unwrap();
        }
        assert_eq!(engine.state().vms.get(VmId(0)).unwrap().size, 3);
        assert_eq!(host.machine_p_state(MachineId(0)), PState::P0);
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_unplaced_task_retried_on_periodic_check() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .task(FakeTask {
                memory: 16_384,
                ..Default::default()
            })
            .task(FakeTask {
                memory: 2048,
                ..Default::default()
            })
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(1)).unwrap();
        assert_eq!(engine.stats().placement_failures, 1);
        assert_eq!(host.task_assigned_vm(TaskId(1)), None);

        host.complete_task(TaskId(0));
        engine.handle_task_completion(&mut host, 1_000_000, TaskId(0)).unwrap();

        engine.handle_periodic_check(&mut host, 2_000_000).unwrap();
        assert!(host.task_assigned_vm(TaskId(1)).is_some());
        assert!(engine.state().unplaced.is_empty());
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_tier_init_splits_thirty_machines() {
        let mut host = FakeHost::builder().machines(30, CpuType::X86).build();
        let mut engine = Engine::new(PolicyKind::Tier, PolicyConfig::default());
        engine.init(&mut host).unwrap();

        // Mid-band split: 12 running with a VM each, 6 staging to S3,
        // 12 powering off.
        assert_eq!(host.vm_count(), 12);
        for i in 0..12 {
            assert!(host.machine_pending(MachineId(i)).is_none());
        }
        for i in 12..18 {
            assert_eq!(host.machine_pending(MachineId(i)), Some(MachineState::S3));
        }
        for i in 18..30 {
            assert_eq!(host.machine_pending(MachineId(i)), Some(MachineState::S5));
        }
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_memory_warning_drains_lightest_task() {
        let mut host = FakeHost::builder()
            .machines(2, CpuType::X86)
            .task(FakeTask {
                memory: 8000,
                ..Default::default()
            })
            .task(FakeTask {
                memory: 4000,
                ..Default::default()
            })
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(1)).unwrap();
        assert_eq!(
            engine.state().cluster.machine(MachineId(0)).unwrap().reserved_memory,
            12_000
        );

        engine.handle_memory_warning(&mut host, 1_000_000, MachineId(0)).unwrap();

        assert_eq!(
            engine.state().cluster.machine(MachineId(0)).unwrap().reserved_memory,
            8000
        );
        assert_eq!(
            engine.state().cluster.machine(MachineId(1)).unwrap().reserved_memory,
            4000
        );
        assert_eq!(engine.stats().memory_warnings, 1);
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_completion_for_unknown_task_is_fatal() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .task(FakeTask::default())
            .build();
        let mut engine = greedy();
        engine.init(&mut host).unwrap();

        let err = engine
            .handle_task_completion(&mut host, 1000, TaskId(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantBroken(_)));
    }

    #[test]
    fn test_simulation_complete_retires_vms_and_reports() {
        let mut host = FakeHost::builder()
            .machines(2, CpuType::X86)
            .task(FakeTask::default())
            .build();
        host.set_energy_kwh(3.25);
        let mut engine = greedy();
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();
        host.complete_task(TaskId(0));
        engine.handle_task_completion(&mut host, 500_000, TaskId(0)).unwrap();

        let report = engine
            .handle_simulation_complete(&mut host, 2_500_000)
            .unwrap();
        assert_eq!(host.vm_count(), 0);
        assert_eq!(report.total_energy_kwh, 3.25);

        let lines = report.stdout_lines();
        assert_eq!(lines[0], "SLA violation report");
        assert!(lines[1].starts_with("SLA0: "));
        assert_eq!(lines[4], "Total Energy 3.250 KW-Hour");
        assert_eq!(lines[5], "Simulation run finished in 2.5 seconds");
    }

    #[test]
    fn test_firstfit_builds_full_os_pools() {
        let mut host = FakeHost::builder()
            .machines(1, CpuType::X86)
            .machines(1, CpuType::Power)
            .build();
        let mut engine = Engine::new(PolicyKind::FirstFit, PolicyConfig::default());
        engine.init(&mut host).unwrap();

        // X86 supports Linux, LinuxRt and Win; Power supports Linux,
        // LinuxRt and Aix.
        assert_eq!(host.vm_count(), 6);
        engine.validate(&host).unwrap();
    }

    #[test]
    fn test_utilsort_sheds_vm_from_hot_machine() {
        let mut host = FakeHost::builder()
            .machines(2, CpuType::X86)
            .task(FakeTask {
                memory: 15_000,
                ..Default::default()
            })
            .build();
        let mut engine = Engine::new(PolicyKind::UtilSort, PolicyConfig::default());
        engine.init(&mut host).unwrap();
        engine.handle_new_task(&mut host, 0, TaskId(0)).unwrap();

        // 15000/16384 > 0.9: the periodic check must start a VM
        // migration toward the idle machine.
        engine.handle_periodic_check(&mut host, 1_000_000).unwrap();
        let vm = engine.state().vms.ids_sorted()[0];
        assert!(engine.state().vms.get(vm).unwrap().migrating);

        host.complete_migration(vm);
        engine.handle_migration_done(&mut host, 1_200_000, vm).unwrap();
        assert_eq!(engine.state().vms.get(vm).unwrap().machine, Some(MachineId(1)));
        assert!(!engine.state().vms.get(vm).unwrap().migrating);
        assert_eq!(host.vm_machine(vm), Some(MachineId(1)));
        engine.validate(&host).unwrap();
    }
}
