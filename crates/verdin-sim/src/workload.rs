//! Synthetic workload generation
//!
//! Builds reproducible task mixes from a seeded RNG: exponential
//! interarrivals, log-normal instruction counts, and weighted draws for
//! CPU family, guest OS, SLA class and GPU affinity. Guest OS draws are
//! filtered to personalities the chosen CPU can actually host.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, LogNormal};
use serde::{Deserialize, Serialize};
use verdin_core::{CpuType, SimTime, SlaClass, VmOs};

/// One task in a workload file or generated mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub arrival: SimTime,
    pub instructions: u64,
    pub memory_mb: u64,
    pub cpu: CpuType,
    pub os: VmOs,
    pub sla: SlaClass,
    #[serde(default)]
    pub gpu_capable: bool,
    /// Absolute deadline.
    pub target_completion: SimTime,
}

/// Generator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub tasks: usize,
    pub seed: u64,
    /// Mean gap between arrivals, microseconds.
    pub mean_interarrival_us: f64,
    /// Median instruction count per task.
    pub median_instructions: f64,
    /// Memory footprints to draw from, MB.
    pub memory_choices: Vec<u64>,
    pub cpu_mix: Vec<(CpuType, f64)>,
    pub os_mix: Vec<(VmOs, f64)>,
    pub sla_mix: Vec<(SlaClass, f64)>,
    pub gpu_fraction: f64,
    /// Deadline slack: target = arrival + slack * nominal runtime.
    pub slack_factor: f64,
}

/// MIPS assumed when turning instruction counts into nominal runtimes.
const REFERENCE_MIPS: f64 = 2400.0;

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            tasks: 64,
            seed: 42,
            mean_interarrival_us: 250_000.0,
            median_instructions: 3.0e9,
            memory_choices: vec![512, 1024, 2048, 4096, 8192],
            cpu_mix: vec![(CpuType::X86, 1.0)],
            os_mix: vec![(VmOs::Linux, 0.7), (VmOs::LinuxRt, 0.2), (VmOs::Win, 0.1)],
            sla_mix: vec![
                (SlaClass::Sla0, 0.1),
                (SlaClass::Sla1, 0.2),
                (SlaClass::Sla2, 0.3),
                (SlaClass::Sla3, 0.4),
            ],
            gpu_fraction: 0.1,
            slack_factor: 2.5,
        }
    }
}

/// Seeded workload generator.
pub struct WorkloadGenerator {
    config: WorkloadConfig,
    rng: StdRng,
}

impl WorkloadGenerator {
    pub fn new(config: WorkloadConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        WorkloadGenerator { config, rng }
    }

    /// Draw the whole mix, sorted by arrival time.
    pub fn generate(&mut self) -> Vec<TaskSpec> {
        let rate = 1.0 / self.config.mean_interarrival_us.max(1.0);
        let interarrival = Exp::new(rate).unwrap();
        // Log-normal around the configured median with moderate spread.
        let mu = self.config.median_instructions.max(1.0).ln();
        let instructions = LogNormal::new(mu, 0.6).unwrap();

        let mut clock = 0u64;
        let mut tasks = Vec::with_capacity(self.config.tasks);
        for _ in 0..self.config.tasks {
            clock += interarrival.sample(&mut self.rng) as u64;

            let cpu = weighted_pick(&mut self.rng, &self.config.cpu_mix, CpuType::X86);
            let legal_os: Vec<(VmOs, f64)> = self
                .config
                .os_mix
                .iter()
                .copied()
                .filter(|(os, _)| os.supported_on(cpu))
                .collect();
            let os = weighted_pick(&mut self.rng, &legal_os, VmOs::Linux);
            let sla = weighted_pick(&mut self.rng, &self.config.sla_mix, SlaClass::Sla3);

            let instr = instructions.sample(&mut self.rng).max(1.0) as u64;
            let memory = self.config.memory_choices
                [self.rng.gen_range(0..self.config.memory_choices.len().max(1))];
            let nominal_us = instr as f64 / REFERENCE_MIPS;
            let target = clock + (nominal_us * self.config.slack_factor) as u64;

            tasks.push(TaskSpec {
                arrival: clock,
                instructions: instr,
                memory_mb: memory,
                cpu,
                os,
                sla,
                gpu_capable: self.rng.gen_bool(self.config.gpu_fraction.clamp(0.0, 1.0)),
                target_completion: target,
            });
        }
        tasks
    }
}

/// Uniform batch of identical tasks, for tests.
pub fn generate_simple(
    count: usize,
    cpu: CpuType,
    memory_mb: u64,
    instructions: u64,
) -> Vec<TaskSpec> {
    (0..count)
        .map(|i| {
            let arrival = i as u64 * 1000;
            TaskSpec {
                arrival,
                instructions,
                memory_mb,
                cpu,
                os: VmOs::Linux,
                sla: SlaClass::Sla1,
                gpu_capable: false,
                target_completion: arrival + instructions / 1000 + 10_000_000,
            }
        })
        .collect()
}

fn weighted_pick<T: Copy>(rng: &mut StdRng, mix: &[(T, f64)], fallback: T) -> T {
    let total: f64 = mix.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return fallback;
    }
    let mut roll = rng.gen_range(0.0..total);
    for (value, weight) in mix {
        let weight = weight.max(0.0);
        if roll < weight {
            return *value;
        }
        roll -= weight;
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_reproducible() {
        let config = WorkloadConfig {
            tasks: 20,
            ..Default::default()
        };
        let a = WorkloadGenerator::new(config.clone()).generate();
        let b = WorkloadGenerator::new(config).generate();
        assert_eq!(a.len(), 20);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.arrival, y.arrival);
            assert_eq!(x.instructions, y.instructions);
            assert_eq!(x.memory_mb, y.memory_mb);
        }
    }

    #[test]
    fn test_arrivals_are_monotonic() {
        let tasks = WorkloadGenerator::new(WorkloadConfig::default()).generate();
        for pair in tasks.windows(2) {
            assert!(pair[0].arrival <= pair[1].arrival);
        }
    }

    #[test]
    fn test_os_draws_respect_cpu_support() {
        let config = WorkloadConfig {
            tasks: 200,
            cpu_mix: vec![(CpuType::Power, 1.0)],
            os_mix: vec![(VmOs::Win, 0.9), (VmOs::Linux, 0.1)],
            ..Default::default()
        };
        let tasks = WorkloadGenerator::new(config).generate();
        // Win cannot run on Power, so every draw must fall back to a
        // legal personality.
        assert!(tasks.iter().all(|t| t.os.supported_on(t.cpu)));
    }

    #[test]
    fn test_deadline_has_slack() {
        let tasks = WorkloadGenerator::new(WorkloadConfig::default()).generate();
        for t in &tasks {
            assert!(t.target_completion > t.arrival);
        }
    }
}
