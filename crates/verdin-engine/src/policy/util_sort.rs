//! Sort-by-utilization policy with DVFS awareness
//!
//! The utilization proxy is the hotter of memory and committed MIPS,
//! with MIPS capacity read at the machine's current P-state - slowing a
//! machine's cores makes it look fuller to placement. Every placement
//! sorts machines coolest-first; the periodic check migrates whole VMs
//! off hosts above the hot threshold and powers off hosts that drained
//! to zero.

use tracing::debug;
use verdin_core::{MachineId, Priority, SimTime, TaskId, VmId};

use crate::error::Result;
use crate::policy::{Placement, Policy, PolicyConfig, PolicyCtx};

/// Utilization above which a machine sheds a VM.
const HOT_THRESHOLD: f64 = 0.9;
/// Minimum utilization gap between source and destination for a
/// hotspot migration to be worth the traffic.
const MIGRATION_GAP: f64 = 0.1;

pub struct UtilSortPolicy {
    config: PolicyConfig,
}

impl UtilSortPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        UtilSortPolicy { config }
    }

    /// Compatible machines sorted ascending by combined utilization.
    /// Equal utilization breaks toward GPU hosts when asked, then the
    /// lower machine id.
    fn sorted_candidates(
        &self,
        ctx: &PolicyCtx<'_>,
        cpu: verdin_core::CpuType,
        prefer_gpu: bool,
    ) -> Vec<MachineId> {
        let mut ids: Vec<MachineId> = ctx.state.cluster.compatible(cpu).to_vec();
        ids.sort_by(|&a, &b| {
            let ua = ctx
                .state
                .cluster
                .machine(a)
                .map(|m| m.utilization())
                .unwrap_or(f64::MAX);
            let ub = ctx
                .state
                .cluster
                .machine(b)
                .map(|m| m.utilization())
                .unwrap_or(f64::MAX);
            let gpu_order = if prefer_gpu {
                // GPU hosts sort before non-GPU at the same load.
                (!ctx.machine_has_gpu(a)).cmp(&!ctx.machine_has_gpu(b))
            } else {
                std::cmp::Ordering::Equal
            };
            ua.partial_cmp(&ub)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(gpu_order)
                .then(a.cmp(&b))
        });
        ids
    }

    /// Projected combined utilization of `machine` after adding the
    /// task's footprint.
    fn projected(ctx: &PolicyCtx<'_>, machine: MachineId, memory: u64, mips: u64) -> f64 {
        let Some(m) = ctx.state.cluster.machine(machine) else {
            return f64::MAX;
        };
        let mem = if m.memory_capacity == 0 {
            f64::MAX
        } else {
            (m.reserved_memory + memory) as f64 / m.memory_capacity as f64
        };
        let capacity = m.cores as u64 * m.performance[m.p_state.index()] as u64;
        let cpu = if capacity == 0 {
            f64::MAX
        } else {
            (m.mips_committed + mips) as f64 / capacity as f64
        };
        mem.max(cpu)
    }

    /// Move one VM off a hot machine to a markedly cooler compatible
    /// one.
    fn shed_from(&self, ctx: &mut PolicyCtx<'_>, machine: MachineId) {
        let (cpu, utilization, vms) = {
            let Some(m) = ctx.state.cluster.machine(machine) else {
                return;
            };
            (m.cpu, m.utilization(), m.vms.clone())
        };
        let vm = vms.into_iter().find(|&vm| {
            ctx.state
                .vms
                .get(vm)
                .map(|v| !v.migrating && !v.is_empty())
                .unwrap_or(false)
        });
        let Some(vm) = vm else {
            return;
        };
        let (memory, mips) = ctx.vm_footprint(vm);

        let dest = self
            .sorted_candidates(ctx, cpu, false)
            .into_iter()
            .find(|&id| {
                if id == machine {
                    return false;
                }
                let Some(m) = ctx.state.cluster.machine(id) else {
                    return false;
                };
                m.is_running()
                    && m.utilization() + MIGRATION_GAP <= utilization
                    && m.fits(memory)
                    && Self::projected(ctx, id, memory, mips) < 1.0
            });
        let Some(dest) = dest else {
            return;
        };
        if let Err(err) = ctx.start_vm_migration(vm, dest) {
            debug!(%vm, %machine, %err, "hotspot migration rejected");
        }
    }
}

impl Policy for UtilSortPolicy {
    fn name(&self) -> &'static str {
        "utilsort"
    }

    fn init(&mut self, _ctx: &mut PolicyCtx<'_>) -> Result<()> {
        Ok(())
    }

    fn place(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) -> Placement {
        let Some(info) = ctx.task(task) else {
            return Placement::Unplaceable;
        };
        let priority = self.config.priority_for(&info);
        let mips = info.mips_demand();

        for id in self.sorted_candidates(ctx, info.required_cpu, info.gpu_capable) {
            let viable = ctx
                .state
                .cluster
                .machine(id)
                .map(|m| m.is_running() && m.fits(info.required_memory))
                .unwrap_or(false);
            if !viable || Self::projected(ctx, id, info.required_memory, mips) >= 1.0 {
                continue;
            }
            match ctx.admit(&info, id, priority) {
                Ok(placement) => return placement,
                Err(err) => {
                    debug!(%task, machine = %id, %err, "candidate rejected");
                }
            }
        }

        // Everything awake is full: wake a sleeper and queue the task
        // on its StateChangeComplete.
        if let Some(machine) = ctx.sleeping_candidate(&info) {
            return ctx.wake_and_defer(&info, machine, priority, None);
        }
        Placement::Unplaceable
    }

    fn on_complete(&mut self, _ctx: &mut PolicyCtx<'_>, _task: TaskId, _vm: VmId) {}

    fn tick(&mut self, ctx: &mut PolicyCtx<'_>, _now: SimTime) {
        let hot: Vec<MachineId> = ctx
            .state
            .cluster
            .machines()
            .filter(|m| m.is_running() && m.utilization() > HOT_THRESHOLD)
            .map(|m| m.id)
            .collect();
        for machine in hot {
            self.shed_from(ctx, machine);
        }

        let idle: Vec<MachineId> = ctx.state.cluster.machines().map(|m| m.id).collect();
        for machine in idle {
            ctx.power_off_if_idle(machine);
        }
    }

    fn on_sla_warning(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) {
        let _ = ctx.host.set_task_priority(task, Priority::High);
        // A hot host is the usual culprit; shed from it right away.
        let machine = ctx
            .state
            .vm_of(task)
            .and_then(|vm| ctx.state.vms.get(vm))
            .and_then(|v| v.machine);
        if let Some(machine) = machine {
            let hot = ctx
                .state
                .cluster
                .machine(machine)
                .map(|m| m.utilization() > HOT_THRESHOLD)
                .unwrap_or(false);
            if hot {
                self.shed_from(ctx, machine);
            }
        }
    }
}
