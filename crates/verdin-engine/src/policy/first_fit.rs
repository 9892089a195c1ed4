//! First-fit policy with full OS coverage
//!
//! At init every running machine gets one VM per guest OS its CPU
//! family supports, so almost every task finds an exact (OS, CPU) home
//! without a VM creation on the hot path. Placement degrades from exact
//! match to CPU-only match (creating the missing VM) and fails cleanly
//! when no compatible machine exists.

use tracing::debug;
use verdin_core::{Priority, SimTime, TaskId, VmId, VmOs};

use crate::error::Result;
use crate::policy::{Placement, Policy, PolicyConfig, PolicyCtx};

pub struct FirstFitPolicy {
    config: PolicyConfig,
}

impl FirstFitPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        FirstFitPolicy { config }
    }
}

impl Policy for FirstFitPolicy {
    fn name(&self) -> &'static str {
        "firstfit"
    }

    fn init(&mut self, ctx: &mut PolicyCtx<'_>) -> Result<()> {
        let machines: Vec<_> = ctx
            .state
            .cluster
            .machines()
            .filter(|m| m.is_running())
            .map(|m| (m.id, m.cpu))
            .collect();
        for (id, cpu) in machines {
            for os in VmOs::ALL {
                if !os.supported_on(cpu) {
                    continue;
                }
                if let Err(err) = ctx.create_and_attach(os, cpu, id) {
                    debug!(machine = %id, ?os, %err, "initial vm pool attach failed");
                }
            }
        }
        Ok(())
    }

    fn place(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) -> Placement {
        let Some(info) = ctx.task(task) else {
            return Placement::Unplaceable;
        };
        let priority = self.config.priority_for(&info);

        // Exact (OS, CPU) match on an existing VM first; GPU-capable
        // tasks try VMs on GPU hosts before the rest.
        let mut vm_ids = ctx.state.vms.ids_sorted();
        if info.gpu_capable {
            vm_ids.sort_by_key(|&vm| {
                let gpu = ctx
                    .state
                    .vms
                    .get(vm)
                    .and_then(|v| v.machine)
                    .map(|m| ctx.machine_has_gpu(m))
                    .unwrap_or(false);
                (!gpu, vm)
            });
        }
        for vm in vm_ids {
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
            if fits && ctx.add_to_vm(vm, &info, priority).is_ok() {
                return Placement::Assigned { vm, machine };
            }
        }

        // CPU-only match: build the missing VM on the first machine of
        // the right family with room.
        let machine = ctx.machine_candidates(&info).into_iter().find(|&id| {
            ctx.state
                .cluster
                .machine(id)
                .map(|m| m.is_running() && m.fits(info.required_memory))
                .unwrap_or(false)
        });
        if let Some(machine) = machine {
            match ctx.admit(&info, machine, priority) {
                Ok(placement) => return placement,
                Err(err) => {
                    debug!(%task, %machine, %err, "cpu-only placement rejected");
                }
            }
        }

        Placement::Unplaceable
    }

    fn on_complete(&mut self, _ctx: &mut PolicyCtx<'_>, _task: TaskId, _vm: VmId) {}

    fn tick(&mut self, _ctx: &mut PolicyCtx<'_>, _now: SimTime) {}

    fn on_sla_warning(&mut self, ctx: &mut PolicyCtx<'_>, task: TaskId) {
        let _ = ctx.host.set_task_priority(task, Priority::High);
    }
}
