//! Simulated machines
//!
//! Each machine carries a per-P-state MIPS table, a per-S-state power
//! table, and a lazily integrated energy counter: power is constant
//! between events, so the counter advances by `watts * dt` whenever
//! something about the machine changes. One watt over one microsecond
//! is one microjoule.

use serde::{Deserialize, Serialize};
use verdin_core::{CpuType, MachineState, PState, SimTime, VmId};

/// Capabilities of one machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub cpu: CpuType,
    pub cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub gpu: bool,
    /// Per-core MIPS at P0..P3
    pub performance: [u32; 4],
    /// Power draw in watts at S0..S5
    pub s_state_power: [u32; 7],
    /// Additional draw in watts when busy at P0..P3
    pub p_state_power: [u32; 4],
}

impl Default for MachineSpec {
    fn default() -> Self {
        MachineSpec {
            cpu: CpuType::X86,
            cores: 8,
            memory_mb: 16_384,
            gpu: false,
            performance: [3000, 2400, 1800, 1000],
            s_state_power: [120, 100, 80, 60, 40, 20, 0],
            p_state_power: [160, 120, 80, 40],
        }
    }
}

/// A run of identical machines in a cluster description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineGroup {
    pub count: u32,
    #[serde(flatten)]
    pub spec: MachineSpec,
}

/// Cluster description: machine ids are dense, assigned group by group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub groups: Vec<MachineGroup>,
}

impl ClusterSpec {
    /// A cluster of `count` identical default machines of one family.
    pub fn uniform(count: u32, cpu: CpuType) -> Self {
        ClusterSpec {
            groups: vec![MachineGroup {
                count,
                spec: MachineSpec {
                    cpu,
                    ..MachineSpec::default()
                },
            }],
        }
    }

    /// Expand the groups into one spec per machine.
    pub fn machine_specs(&self) -> Vec<MachineSpec> {
        let mut specs = Vec::new();
        for group in &self.groups {
            for _ in 0..group.count {
                specs.push(group.spec.clone());
            }
        }
        specs
    }
}

/// Ground-truth machine state inside the simulator.
#[derive(Debug)]
pub(crate) struct SimMachine {
    pub spec: MachineSpec,
    pub s_state: MachineState,
    /// Target of an in-flight transition.
    pub pending_target: Option<MachineState>,
    /// Bumped per transition request; stale completion events carry an
    /// older epoch and are dropped.
    pub transition_epoch: u64,
    pub p_state: PState,
    pub memory_used: u64,
    pub vms: Vec<VmId>,
    pub energy_uj: f64,
    pub last_accrual: SimTime,
}

impl SimMachine {
    pub fn new(spec: MachineSpec) -> Self {
        SimMachine {
            spec,
            s_state: MachineState::S0,
            pending_target: None,
            transition_epoch: 0,
            p_state: PState::P1,
            memory_used: 0,
            vms: Vec::new(),
            energy_uj: 0.0,
            last_accrual: 0,
        }
    }

    /// Whether downcalls needing a running machine may proceed.
    pub fn accepts_work(&self) -> bool {
        self.s_state == MachineState::S0 && self.pending_target.is_none()
    }

    /// Draw right now, given whether any task is executing.
    pub fn power_watts(&self, busy: bool) -> f64 {
        let base = self.spec.s_state_power[self.s_state.index()] as f64;
        if busy && self.s_state == MachineState::S0 {
            base + self.spec.p_state_power[self.p_state.index()] as f64
        } else {
            base
        }
    }

    /// Integrate energy up to `now`.
    pub fn accrue(&mut self, now: SimTime, busy: bool) {
        if now > self.last_accrual {
            let dt = (now - self.last_accrual) as f64;
            self.energy_uj += self.power_watts(busy) * dt;
            self.last_accrual = now;
        }
    }

    /// Per-core MIPS at the current P-state.
    pub fn mips(&self) -> u32 {
        self.spec.performance[self.p_state.index()]
    }

    /// Microseconds an S-state transition takes. Waking from deep
    /// states is slow; descending is quick.
    pub fn transition_latency(from: MachineState, to: MachineState) -> SimTime {
        if to == MachineState::S0 {
            match from {
                MachineState::S0 => 0,
                MachineState::S0i1 => 1_000,
                MachineState::S1 => 5_000,
                MachineState::S2 => 20_000,
                MachineState::S3 => 50_000,
                MachineState::S4 => 200_000,
                MachineState::S5 => 1_000_000,
            }
        } else {
            10_000
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_cluster_expansion() {
        let spec = ClusterSpec::uniform(4, CpuType::Arm);
        let machines = spec.machine_specs();
        assert_eq!(machines.len(), 4);
        assert!(machines.iter().all(|m| m.cpu == CpuType::Arm));
    }

    #[test]
    fn test_energy_integrates_power_over_time() {
        let mut m = SimMachine::new(MachineSpec::default());
        // Idle S0 draws 120 W; one second is 120 J.
        m.accrue(1_000_000, false);
        assert!((m.energy_uj - 120.0 * 1_000_000.0).abs() < 1e-6);

        // A busy second at P1 adds the dynamic draw on top.
        m.accrue(2_000_000, true);
        let expected = (120.0 + 240.0) * 1_000_000.0;
        assert!((m.energy_uj - expected).abs() < 1e-6);
    }

    #[test]
    fn test_off_machine_draws_nothing() {
        let mut m = SimMachine::new(MachineSpec::default());
        m.s_state = MachineState::S5;
        m.accrue(10_000_000, false);
        assert_eq!(m.energy_uj, 0.0);
    }

    #[test]
    fn test_wake_latency_grows_with_depth() {
        let s3 = SimMachine::transition_latency(MachineState::S3, MachineState::S0);
        let s5 = SimMachine::transition_latency(MachineState::S5, MachineState::S0);
        assert!(s5 > s3);
    }
}
