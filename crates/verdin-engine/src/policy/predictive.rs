//! Response-time predictive policy
//!
//! Placement steers by observed latency instead of a utilization proxy:
//! each VM carries a window of its last ten response times, and new
//! tasks go to the compatible VM answering fastest. The window's trend
//! drives DVFS - a worsening slope buys faster cores, an improving one
//! gives them back. Same-sized workloads therefore pool on the same
//! host, which keeps one VM's P-state request from fighting its
//! neighbors'.

use tracing::debug;
use verdin_core::{MachineId, SimTime, TaskId, VmId};

use crate::error::Result;
use crate::policy::{Placement, Policy, PolicyConfig, PolicyCtx};

/// Window trend beyond which the VM size steps up or down.
const SLOPE_THRESHOLD: f64 = 0.10;
/// Completions between DVFS reviews, per VM.
const DVFS_CADENCE: u64 = 10;
/// Completions between consolidation sweeps, across all VMs.
const CONSOLIDATE_CADENCE: u64 = 50;

pub struct PredictivePolicy {
    config: PolicyConfig,
    total_completions: u64,
}

impl PredictivePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        PredictivePolicy {
            config,
            total_completions: 0,
        }
    }

    /// Step the VM's size after a review window: slope above the
    /// threshold buys a faster P-state, below the negative threshold
    /// releases one. Saturates at the size bounds.
    fn review_dvfs(&self, ctx: &mut PolicyCtx<'_>, vm: VmId) {
        let (slope, size) = {
            let Some(shadow) = ctx.state.vms.get(vm) else {
                return;
            };
            let Some(slope) = shadow.window.slope() else {
                return;
            };
            (slope, shadow.size)
        };
        let target = if slope > SLOPE_THRESHOLD {
            size.saturating_add(1)
        } else if slope < -SLOPE_THRESHOLD {
            size.saturating_sub(1)
        } else {
            return;
        };
        debug!(%vm, slope, from = size, to = target, "dvfs review");
        let _ = ctx.set_vm_size(vm, target);
    }

    /// Shut down VMs on machines with no work anywhere, then power the
    /// machines off.
    fn consolidate(&self, ctx: &mut PolicyCtx<'_>) {
        let ids: Vec<MachineId> = ctx.state.cluster.machines().map(|m| m.id).collect();
        for id in ids {
            ctx.power_off_if_idle(id);
        }
    }
}

impl Policy for PredictivePolicy {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn init(&mut self, _ctx: &mut PolicyCtx<'_>) -> Result<()> {
        // VMs appear on demand; the windows need traffic before the
        // policy has anything to predict.
        Ok(())
    }

    fn place(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) -> Placement {
        let Some(info) = ctx.task(task) else {
            return Placement::Unplaceable;
        };
        let priority = self.config.priority_for(&info);

        // Fastest compatible VM whose host can still take the task;
        // on equal means a GPU host wins for a GPU-capable task.
        let mut best: Option<(f64, bool, VmId, MachineId)> = None;
        for vm in ctx.state.vms.ids_sorted() {
            let Some(shadow) = ctx.state.vms.get(vm) else {
                continue;
            };
            if shadow.migrating
                || shadow.os != info.required_vm
                || shadow.cpu != info.required_cpu
            {
                continue;
            }
            let Some(machine) = shadow.machine else {
                continue;
            };
            let fits = ctx
                .state
                .cluster
                .machine(machine)
                .map(|m| m.is_running() && m.fits(info.required_memory))
                .unwrap_or(false);
            if !fits {
                continue;
            }
            let mean = shadow.window.mean().unwrap_or(0.0);
            let gpu = ctx.machine_has_gpu(machine);
            let better = match best {
                None => true,
                Some((cur_mean, cur_gpu, _, _)) => match mean.partial_cmp(&cur_mean) {
                    Some(std::cmp::Ordering::Less) => true,
                    Some(std::cmp::Ordering::Equal) => info.gpu_capable && gpu && !cur_gpu,
                    _ => false,
                },
            };
            if better {
                best = Some((mean, gpu, vm, machine));
            }
        }
        if let Some((_, _, vm, machine)) = best {
            if ctx.add_to_vm(vm, &info, priority).is_ok() {
                return Placement::Assigned { vm, machine };
            }
        }

        // No usable VM: spin one up, preferring a machine that is
        // already awake before waking a sleeper.
        let running = ctx.machine_candidates(&info).into_iter().find(|&id| {
            ctx.state
                .cluster
                .machine(id)
                .map(|m| m.is_running() && m.fits(info.required_memory))
                .unwrap_or(false)
        });
        if let Some(machine) = running {
            if let Ok(placement) = ctx.admit(&info, machine, priority) {
                return placement;
            }
        }
        if let Some(machine) = ctx.sleeping_candidate(&info) {
            return ctx.wake_and_defer(&info, machine, priority, None);
        }
        Placement::Unplaceable
    }

    fn on_complete(&mut self, ctx: &mut PolicyCtx<'_>, _task: TaskId, vm: VmId) {
        self.total_completions += 1;

        let due_dvfs = ctx
            .state
            .vms
            .get(vm)
            .map(|v| v.completions > 0 && v.completions % DVFS_CADENCE == 0)
            .unwrap_or(false);
        if due_dvfs {
            self.review_dvfs(ctx, vm);
        }
        if self.total_completions % CONSOLIDATE_CADENCE == 0 {
            self.consolidate(ctx);
        }
    }

    fn tick(&mut self, _ctx: &mut PolicyCtx<'_>, _now: SimTime) {}

    fn on_sla_warning(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) {
        // Latency pressure: buy faster cores for the host serving the
        // task.
        let Some(vm) = ctx.state.vm_of(task) else {
            return;
        };
        let size = ctx.state.vms.get(vm).map(|v| v.size).unwrap_or(0);
        let _ = ctx.set_vm_size(vm, size.saturating_add(1));
    }
}
