//! Drain planning
//!
//! When a machine overcommits (MemoryWarning) or a task needs to escape
//! a hot host, the engine picks destinations for the displaced tasks.
//! The optimal planner runs the Kuhn-Munkres algorithm over a cost
//! matrix of transfer time plus destination load; a first-fit fallback
//! exists for when the matrix cannot be formed.

use std::collections::HashMap;

use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;
use verdin_core::{MachineId, TaskId, TaskInfo};

use crate::cluster::MachineShadow;

/// MB/s the planner assumes for moving task state between machines.
const LINK_MB_PER_SEC: f64 = 1250.0;

/// Cost used for infeasible pairings when the matrix must stay finite.
const INFEASIBLE: i64 = 1_000_000_000;

/// Plans task-to-machine reassignment for displaced tasks.
pub struct DrainPlanner;

impl DrainPlanner {
    /// Cost of moving one task to one machine, in seconds.
    ///
    /// `f64::INFINITY` when the machine cannot legally take the task:
    /// wrong CPU family, not running, or not enough free shadow memory.
    fn migration_cost(task: &TaskInfo, machine: &MachineShadow) -> f64 {
        if machine.cpu != task.required_cpu
            || !machine.is_running()
            || !machine.fits(task.required_memory)
        {
            return f64::INFINITY;
        }
        let transfer = task.required_memory as f64 / LINK_MB_PER_SEC;
        // Bias toward cooler destinations so a drain does not create
        // the next hotspot.
        transfer * (1.0 + machine.utilization())
    }

    /// Minimum-cost assignment of displaced tasks to destinations.
    ///
    /// Tasks that fit nowhere are left out of the returned map. With
    /// more tasks than machines the matrix is padded square and the
    /// overflow stays unassigned.
    pub fn plan_optimal(
        displaced: &[TaskInfo],
        destinations: &[&MachineShadow],
    ) -> HashMap<TaskId, MachineId> {
        if displaced.is_empty() || destinations.is_empty() {
            return HashMap::new();
        }

        let num_tasks = displaced.len();
        let num_machines = destinations.len();
        let side = num_tasks.max(num_machines);

        // Integer costs in milliseconds; the padding cells stay at the
        // infeasible sentinel.
        let mut cells = vec![INFEASIBLE; side * side];
        for (i, task) in displaced.iter().enumerate() {
            for (j, machine) in destinations.iter().enumerate() {
                let cost = Self::migration_cost(task, machine);
                if cost.is_finite() {
                    cells[i * side + j] = (cost * 1000.0) as i64;
                }
            }
        }

        let matrix = match Matrix::from_vec(side, side, cells) {
            Ok(m) => m,
            Err(_) => return Self::plan_first_fit(displaced, destinations),
        };
        let (_total, assignment) = kuhn_munkres_min(&matrix);

        let mut plan = HashMap::new();
        for (task_idx, machine_idx) in assignment.into_iter().enumerate() {
            if task_idx < num_tasks
                && machine_idx < num_machines
                && Self::migration_cost(&displaced[task_idx], destinations[machine_idx]).is_finite()
            {
                plan.insert(displaced[task_idx].task_id, destinations[machine_idx].id);
            }
        }
        plan
    }

    /// First-fit baseline: each task goes to the first machine that can
    /// take it, tracking memory as it goes.
    pub fn plan_first_fit(
        displaced: &[TaskInfo],
        destinations: &[&MachineShadow],
    ) -> HashMap<TaskId, MachineId> {
        let mut plan = HashMap::new();
        let mut extra: HashMap<MachineId, u64> = HashMap::new();

        for task in displaced {
            for machine in destinations {
                let claimed = extra.get(&machine.id).copied().unwrap_or(0);
                if machine.cpu == task.required_cpu
                    && machine.is_running()
                    && machine.fits(claimed + task.required_memory)
                {
                    plan.insert(task.task_id, machine.id);
                    *extra.entry(machine.id).or_insert(0) += task.required_memory;
                    break;
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdin_core::{CpuType, MachineState, PState, Priority, SlaClass, VmOs};

    fn machine(id: u32, cpu: CpuType, capacity: u64, reserved: u64) -> MachineShadow {
        MachineShadow {
            id: MachineId(id),
            cpu,
            cores: 8,
            memory_capacity: capacity,
            gpu: false,
            performance: [3000, 2400, 1800, 1000],
            s_state: MachineState::S0,
            transition_pending: false,
            p_state: PState::P1,
            reserved_memory: reserved,
            mips_committed: 0,
            vms: Vec::new(),
        }
    }

    fn task(id: u32, cpu: CpuType, memory: u64) -> TaskInfo {
        TaskInfo {
            task_id: TaskId(id),
            required_cpu: cpu,
            required_vm: VmOs::Linux,
            required_memory: memory,
            required_sla: SlaClass::Sla2,
            arrival: 0,
            target_completion: 10_000_000,
            total_instructions: 1_000_000,
            remaining_instructions: 1_000_000,
            gpu_capable: false,
            completed: false,
            priority: Priority::Low,
        }
    }

    #[test]
    fn test_cost_infeasible_on_cpu_mismatch() {
        let m = machine(0, CpuType::Arm, 16384, 0);
        let t = task(1, CpuType::X86, 1024);
        assert!(DrainPlanner::migration_cost(&t, &m).is_infinite());
    }

    #[test]
    fn test_cost_infeasible_when_memory_short() {
        let m = machine(0, CpuType::X86, 4096, 4000);
        let t = task(1, CpuType::X86, 1024);
        assert!(DrainPlanner::migration_cost(&t, &m).is_infinite());
    }

    #[test]
    fn test_cost_prefers_cooler_destination() {
        let cold = machine(0, CpuType::X86, 16384, 0);
        let hot = machine(1, CpuType::X86, 16384, 12288);
        let t = task(1, CpuType::X86, 1024);
        assert!(
            DrainPlanner::migration_cost(&t, &cold) < DrainPlanner::migration_cost(&t, &hot)
        );
    }

    #[test]
    fn test_optimal_assigns_every_feasible_task() {
        let m0 = machine(0, CpuType::X86, 16384, 0);
        let m1 = machine(1, CpuType::X86, 16384, 0);
        let tasks = vec![task(1, CpuType::X86, 2048), task(2, CpuType::X86, 4096)];

        let plan = DrainPlanner::plan_optimal(&tasks, &[&m0, &m1]);
        assert_eq!(plan.len(), 2);
        assert!(plan.contains_key(&TaskId(1)));
        assert!(plan.contains_key(&TaskId(2)));
    }

    #[test]
    fn test_optimal_skips_oversized_task() {
        let m0 = machine(0, CpuType::X86, 4096, 0);
        let tasks = vec![task(1, CpuType::X86, 8192)];

        let plan = DrainPlanner::plan_optimal(&tasks, &[&m0]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_optimal_empty_inputs() {
        let m0 = machine(0, CpuType::X86, 4096, 0);
        assert!(DrainPlanner::plan_optimal(&[], &[&m0]).is_empty());
        assert!(DrainPlanner::plan_optimal(&[task(1, CpuType::X86, 10)], &[]).is_empty());
    }

    #[test]
    fn test_first_fit_respects_running_totals() {
        // Both tasks fit individually but not together on machine 0.
        let m0 = machine(0, CpuType::X86, 4096, 0);
        let m1 = machine(1, CpuType::X86, 4096, 0);
        let tasks = vec![task(1, CpuType::X86, 3000), task(2, CpuType::X86, 3000)];

        let plan = DrainPlanner::plan_first_fit(&tasks, &[&m0, &m1]);
        assert_eq!(plan.get(&TaskId(1)), Some(&MachineId(0)));
        assert_eq!(plan.get(&TaskId(2)), Some(&MachineId(1)));
    }

    #[test]
    fn test_planner_ignores_sleeping_machines() {
        let mut m0 = machine(0, CpuType::X86, 16384, 0);
        m0.s_state = MachineState::S5;
        let tasks = vec![task(1, CpuType::X86, 1024)];

        assert!(DrainPlanner::plan_optimal(&tasks, &[&m0]).is_empty());
        assert!(DrainPlanner::plan_first_fit(&tasks, &[&m0]).is_empty());
    }
}
