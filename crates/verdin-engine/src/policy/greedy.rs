//! Greedy consolidating policy
//!
//! Placement is first-fit over running machines in id order; the
//! utilization proxy is memory. Completions trigger consolidation once
//! enough machines are busy: the lightest task on the least-utilized
//! machine moves to the most-utilized machine that still has room, and
//! machines drained empty are put to S5 on the next periodic check.

use tracing::debug;
use verdin_core::{MachineId, Priority, SimTime, TaskId, TaskInfo, VmId};

use crate::error::Result;
use crate::policy::{Placement, Policy, PolicyConfig, PolicyCtx};

/// Machines that must be busy before consolidation kicks in.
const CONSOLIDATION_THRESHOLD: usize = 4;

pub struct GreedyPolicy {
    config: PolicyConfig,
}

impl GreedyPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        GreedyPolicy { config }
    }

    /// Move the lightest task from the emptiest busy machine onto the
    /// fullest machine that can still take it.
    fn consolidate(&self, ctx: &mut PolicyCtx<'_>) {
        let src = ctx
            .state
            .cluster
            .machines()
            .filter(|m| m.is_running() && m.reserved_memory > 0)
            .min_by(|a, b| {
                a.mem_utilization()
                    .partial_cmp(&b.mem_utilization())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .map(|m| m.id);
        let Some(src) = src else {
            return;
        };

        let mut lightest: Option<TaskInfo> = None;
        if let Some(m) = ctx.state.cluster.machine(src) {
            for &vm in &m.vms {
                let Some(shadow) = ctx.state.vms.get(vm) else {
                    continue;
                };
                if shadow.migrating {
                    continue;
                }
                for &task in &shadow.tasks {
                    if let Some(info) = ctx.host.task_info(task) {
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
        }
        let Some(info) = lightest else {
            return;
        };

        let dest = ctx
            .state
            .cluster
            .machines()
            .filter(|m| {
                m.id != src
                    && m.is_running()
                    && m.cpu == info.required_cpu
                    && m.fits(info.required_memory)
            })
            .max_by(|a, b| {
                a.mem_utilization()
                    .partial_cmp(&b.mem_utilization())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.id.cmp(&a.id))
            })
            .map(|m| m.id);
        let Some(dest) = dest else {
            return;
        };

        let priority = info.priority;
        if let Err(err) = ctx.move_task(info.task_id, dest, priority) {
            debug!(task = %info.task_id, %err, "consolidation move rejected");
        }
    }
}

impl Policy for GreedyPolicy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn init(&mut self, _ctx: &mut PolicyCtx<'_>) -> Result<()> {
        // All machines stay in S0; VMs are created on demand and idle
        // machines drift to S5 through the periodic check.
        Ok(())
    }

    fn place(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) -> Placement {
        let Some(info) = ctx.task(task) else {
            return Placement::Unplaceable;
        };
        let priority = self.config.priority_for(&info);

        for id in ctx.machine_candidates(&info) {
            let viable = ctx
                .state
                .cluster
                .machine(id)
                .map(|m| m.is_running() && m.fits(info.required_memory))
                .unwrap_or(false);
            if !viable {
                continue;
            }
            match ctx.admit(&info, id, priority) {
                Ok(placement) => return placement,
                Err(err) => {
                    debug!(%task, machine = %id, %err, "candidate rejected");
                }
            }
        }

        // Nothing running has room; wake a sleeper rather than fail.
        if let Some(machine) = ctx.sleeping_candidate(&info) {
            return ctx.wake_and_defer(&info, machine, priority, None);
        }
        Placement::Unplaceable
    }

    fn on_complete(&mut self, ctx: &mut PolicyCtx<'_>, _task: TaskId, _vm: VmId) {
        let busy = ctx
            .state
            .cluster
            .machines()
            .filter(|m| m.reserved_memory > 0)
            .count();
        if busy >= CONSOLIDATION_THRESHOLD {
            self.consolidate(ctx);
        }
    }

    fn tick(&mut self, ctx: &mut PolicyCtx<'_>, _now: SimTime) {
        let ids: Vec<MachineId> = ctx.state.cluster.machines().map(|m| m.id).collect();
        for id in ids {
            ctx.power_off_if_idle(id);
        }
    }

    fn on_sla_warning(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) {
        let Some(info) = ctx.task(task) else {
            return;
        };
        let _ = ctx.host.set_task_priority(task, Priority::High);

        let current_vm = ctx.state.vm_of(task);
        let current_machine =
            current_vm.and_then(|vm| ctx.state.vms.get(vm)).and_then(|v| v.machine);

        // Coolest compatible machine that can admit the task.
        let dest = ctx
            .state
            .cluster
            .machines()
            .filter(|m| {
                m.is_running() && m.cpu == info.required_cpu && m.fits(info.required_memory)
            })
            .min_by(|a, b| {
                a.mem_utilization()
                    .partial_cmp(&b.mem_utilization())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
            .map(|m| m.id);

        match dest {
            Some(dest) if Some(dest) != current_machine => {
                if let Err(err) = ctx.move_task(task, dest, Priority::High) {
                    debug!(%task, %err, "sla relocation rejected");
                }
            }
            Some(_) => {}
            None => {
                if let Some(machine) = ctx.sleeping_candidate(&info) {
                    ctx.wake_and_defer(&info, machine, Priority::High, current_vm);
                }
            }
        }
    }
}
