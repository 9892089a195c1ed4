//! Three-tier power management policy
//!
//! Machines are partitioned into RUNNING (S0, carrying VMs),
//! INTERMEDIATE (S3, empty, fast wake) and SWITCHED_OFF (S5). Tier
//! sizes follow system load; reconciliation moves one machine per step
//! so the cluster tracks demand without thrashing. The utilization
//! proxy is memory.

use std::collections::HashMap;

use tracing::{debug, info};
use verdin_core::{MachineId, MachineState, Priority, SimTime, TaskId, VmId, VmOs};

use crate::error::Result;
use crate::policy::{Placement, Policy, PolicyConfig, PolicyCtx};

const HIGH_LOAD: f64 = 0.7;
const LOW_LOAD: f64 = 0.3;
/// Peak tasks one running machine is assumed to absorb.
const TASKS_PER_MACHINE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Running,
    Intermediate,
    SwitchedOff,
}

/// Desired (running, intermediate) sizes for a cluster of `total`
/// machines under the given load with `active` tasks in flight.
fn desired_sizes(total: usize, active: usize, load: f64) -> (usize, usize) {
    let (mut running, mut intermediate) = if load > HIGH_LOAD {
        (
            ((total as f64 * 0.6) as usize).max(4),
            ((total as f64 * 0.2) as usize).max(2),
        )
    } else if load < LOW_LOAD {
        (
            ((total as f64 * 0.3) as usize).max(2),
            ((total as f64 * 0.2) as usize).max(2),
        )
    } else {
        (
            ((total as f64 * 0.4) as usize).max(3),
            ((total as f64 * 0.2) as usize).max(2),
        )
    };
    let floor = active.div_ceil(TASKS_PER_MACHINE).max(2);
    running = running.max(floor).min(total);
    if running + intermediate > total {
        intermediate = total - running;
    }
    (running, intermediate)
}

pub struct TierPolicy {
    config: PolicyConfig,
    tiers: HashMap<MachineId, Tier>,
}

impl TierPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        TierPolicy {
            config,
            tiers: HashMap::new(),
        }
    }

    fn count(&self, tier: Tier) -> usize {
        self.tiers.values().filter(|&&t| t == tier).count()
    }

    fn tier_of(&self, machine: MachineId) -> Tier {
        self.tiers
            .get(&machine)
            .copied()
            .unwrap_or(Tier::SwitchedOff)
    }

    /// Machines of one tier, ascending by id.
    fn members(&self, tier: Tier) -> Vec<MachineId> {
        let mut ids: Vec<MachineId> = self
            .tiers
            .iter()
            .filter(|(_, &t)| t == tier)
            .map(|(&id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Tasks the engine is responsible for right now.
    fn active_tasks(ctx: &PolicyCtx<'_>) -> usize {
        ctx.state.assignments.len() + ctx.state.pending.len() + ctx.state.unplaced.len()
    }

    /// Promote one intermediate machine to running (S0 requested, VM
    /// attached on StateChangeComplete).
    fn promote_one(&mut self, ctx: &mut PolicyCtx<'_>) -> bool {
        for id in self.members(Tier::Intermediate) {
            if ctx.request_state(id, MachineState::S0).is_ok() {
                self.tiers.insert(id, Tier::Running);
                info!(machine = %id, "promoted to running tier");
                return true;
            }
        }
        false
    }

    /// Demote one empty running machine to intermediate.
    fn demote_one(&mut self, ctx: &mut PolicyCtx<'_>) -> bool {
        for id in self.members(Tier::Running) {
            let empty = ctx
                .state
                .cluster
                .machine(id)
                .map(|m| m.is_running() && m.reserved_memory == 0)
                .unwrap_or(false);
            if !empty || ctx.state.pending.waiting_on(id) > 0 {
                continue;
            }
            let vms = ctx
                .state
                .cluster
                .machine(id)
                .map(|m| m.vms.clone())
                .unwrap_or_default();
            if vms.iter().any(|&vm| {
                ctx.state
                    .vms
                    .get(vm)
                    .map(|v| !v.is_empty() || v.migrating)
                    .unwrap_or(false)
            }) {
                continue;
            }
            for vm in vms {
                let _ = ctx.retire_vm(vm);
            }
            if ctx.request_state(id, MachineState::S3).is_ok() {
                self.tiers.insert(id, Tier::Intermediate);
                info!(machine = %id, "demoted to intermediate tier");
                return true;
            }
        }
        false
    }

    /// Wake one switched-off machine into the intermediate tier.
    fn stage_one(&mut self, ctx: &mut PolicyCtx<'_>) -> bool {
        for id in self.members(Tier::SwitchedOff) {
            if ctx.request_state(id, MachineState::S3).is_ok() {
                self.tiers.insert(id, Tier::Intermediate);
                debug!(machine = %id, "staged from off to intermediate");
                return true;
            }
        }
        false
    }

    /// Power one intermediate machine fully off.
    fn retire_one(&mut self, ctx: &mut PolicyCtx<'_>) -> bool {
        for id in self.members(Tier::Intermediate) {
            let idle = ctx
                .state
                .cluster
                .machine(id)
                .map(|m| m.reserved_memory == 0 && m.vms.is_empty())
                .unwrap_or(false);
            if !idle || ctx.state.pending.waiting_on(id) > 0 {
                continue;
            }
            if ctx.request_state(id, MachineState::S5).is_ok() {
                self.tiers.insert(id, Tier::SwitchedOff);
                debug!(machine = %id, "retired from intermediate to off");
                return true;
            }
        }
        false
    }

    /// Move tier populations one step toward their desired sizes.
    fn adjust_tiers(&mut self, ctx: &mut PolicyCtx<'_>) {
        let total = ctx.state.cluster.len();
        if total == 0 {
            return;
        }
        let load = ctx.state.cluster.system_load();
        let (want_running, want_intermediate) =
            desired_sizes(total, Self::active_tasks(ctx), load);

        let running = self.count(Tier::Running);
        if running < want_running {
            self.promote_one(ctx);
        } else if running > want_running {
            self.demote_one(ctx);
        }

        let running = self.count(Tier::Running);
        let intermediate = self.count(Tier::Intermediate);
        if running + intermediate < want_running + want_intermediate {
            self.stage_one(ctx);
        } else if intermediate > want_intermediate {
            self.retire_one(ctx);
        }
    }
}

impl Policy for TierPolicy {
    fn name(&self) -> &'static str {
        "tier"
    }

    fn init(&mut self, ctx: &mut PolicyCtx<'_>) -> Result<()> {
        let total = ctx.state.cluster.len();
        // Mid-band sizing at startup; load is unknown until work
        // arrives.
        let (want_running, want_intermediate) = desired_sizes(total, 0, 0.5);

        let ids: Vec<MachineId> = ctx.state.cluster.machines().map(|m| m.id).collect();
        for (idx, id) in ids.into_iter().enumerate() {
            if idx < want_running {
                self.tiers.insert(id, Tier::Running);
                let cpu = ctx.state.cluster.machine(id).map(|m| m.cpu);
                if let Some(cpu) = cpu {
                    if let Err(err) = ctx.create_and_attach(VmOs::Linux, cpu, id) {
                        debug!(machine = %id, %err, "initial vm attach deferred");
                    }
                }
            } else if idx < want_running + want_intermediate {
                self.tiers.insert(id, Tier::Intermediate);
                let _ = ctx.request_state(id, MachineState::S3);
            } else {
                self.tiers.insert(id, Tier::SwitchedOff);
                let _ = ctx.request_state(id, MachineState::S5);
            }
        }
        info!(
            running = self.count(Tier::Running),
            intermediate = self.count(Tier::Intermediate),
            off = self.count(Tier::SwitchedOff),
            "tier policy initialized"
        );
        Ok(())
    }

    fn place(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) -> Placement {
        let Some(info) = ctx.task(task) else {
            return Placement::Unplaceable;
        };
        let priority = self.config.priority_for(&info);

        // First fit within the running tier; GPU hosts first when the
        // task wants one.
        let mut running = self.members(Tier::Running);
        if info.gpu_capable {
            running.sort_by_key(|&id| (!ctx.machine_has_gpu(id), id));
        }
        for id in running {
            let viable = ctx
                .state
                .cluster
                .machine(id)
                .map(|m| {
                    m.is_running() && m.cpu == info.required_cpu && m.fits(info.required_memory)
                })
                .unwrap_or(false);
            if !viable {
                continue;
            }
            if let Ok(placement) = ctx.admit(&info, id, priority) {
                self.adjust_tiers(ctx);
                return placement;
            }
        }

        // Miss: pull a compatible intermediate machine into the running
        // tier and park the task until it wakes.
        let mut standby = self.members(Tier::Intermediate);
        if info.gpu_capable {
            standby.sort_by_key(|&id| (!ctx.machine_has_gpu(id), id));
        }
        let staged = standby.into_iter().find(|&id| {
            ctx.state
                .cluster
                .machine(id)
                .map(|m| m.cpu == info.required_cpu && m.memory_capacity >= info.required_memory)
                .unwrap_or(false)
        });
        if let Some(id) = staged {
            self.tiers.insert(id, Tier::Running);
            let placement = ctx.wake_and_defer(&info, id, priority, None);
            self.adjust_tiers(ctx);
            return placement;
        }

        Placement::Unplaceable
    }

    fn on_complete(&mut self, ctx: &mut PolicyCtx<'_>, _task: TaskId, _vm: VmId) {
        self.adjust_tiers(ctx);
    }

    fn tick(&mut self, ctx: &mut PolicyCtx<'_>, _now: SimTime) {
        self.adjust_tiers(ctx);
    }

    fn on_sla_warning(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) {
        let _ = ctx.host.set_task_priority(task, Priority::High);
        // Capacity pressure is the usual cause; widen the running tier.
        self.promote_one(ctx);
    }

    fn on_state_change(&mut self, ctx: &mut PolicyCtx<'_>, machine: MachineId) {
        if self.tier_of(machine) != Tier::Running {
            return;
        }
        let needs_vm = ctx
            .state
            .cluster
            .machine(machine)
            .map(|m| m.is_running() && m.vms.is_empty())
            .unwrap_or(false);
        if needs_vm {
            let cpu = ctx.state.cluster.machine(machine).map(|m| m.cpu);
            if let Some(cpu) = cpu {
                if let Err(err) = ctx.create_and_attach(VmOs::Linux, cpu, machine) {
                    debug!(%machine, %err, "post-wake vm attach failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_sizes_high_load() {
        let (running, intermediate) = desired_sizes(30, 60, 0.8);
        assert_eq!(running, 18); // 0.6 * 30
        assert_eq!(intermediate, 6); // 0.2 * 30
    }

    #[test]
    fn test_desired_sizes_low_load() {
        let (running, intermediate) = desired_sizes(30, 0, 0.1);
        assert_eq!(running, 9); // 0.3 * 30
        assert_eq!(intermediate, 6);
    }

    #[test]
    fn test_desired_sizes_mid_load() {
        let (running, intermediate) = desired_sizes(30, 8, 0.5);
        assert_eq!(running, 12); // 0.4 * 30
        assert_eq!(intermediate, 6);
    }

    #[test]
    fn test_running_floor_tracks_active_tasks() {
        // 60 active tasks need 15 machines even at low load.
        let (running, _) = desired_sizes(30, 60, 0.1);
        assert_eq!(running, 15);
    }

    #[test]
    fn test_small_cluster_floors() {
        let (running, intermediate) = desired_sizes(4, 0, 0.5);
        assert_eq!(running, 3); // floor for the mid band
        assert_eq!(intermediate, 1); // clamped to total
    }

    #[test]
    fn test_running_never_exceeds_total() {
        let (running, intermediate) = desired_sizes(3, 100, 0.9);
        assert_eq!(running, 3);
        assert_eq!(intermediate, 0);
    }
}
