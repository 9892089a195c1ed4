//! Core types shared across Verdin components

use serde::{Deserialize, Serialize};

/// Simulated clock value, in microseconds since simulation start.
pub type SimTime = u64;

/// Unique identifier for a physical machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(pub u32);

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmId(pub u32);

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Mid,
    Low,
}

/// Guest operating system a VM boots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmOs {
    Linux,
    LinuxRt,
    Win,
    Aix,
}

impl VmOs {
    /// All guest OS personalities, in wire order.
    pub const ALL: [VmOs; 4] = [VmOs::Linux, VmOs::LinuxRt, VmOs::Win, VmOs::Aix];

    /// Whether this guest OS can run on the given CPU family.
    ///
    /// Linux and LinuxRt run everywhere; Win is limited to ARM and X86;
    /// AIX only boots on POWER.
    pub fn supported_on(self, cpu: CpuType) -> bool {
        match self {
            VmOs::Linux | VmOs::LinuxRt => true,
            VmOs::Win => matches!(cpu, CpuType::Arm | CpuType::X86),
            VmOs::Aix => cpu == CpuType::Power,
        }
    }
}

/// CPU architecture family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuType {
    X86,
    Power,
    Arm,
    Riscv,
}

impl CpuType {
    pub const ALL: [CpuType; 4] = [CpuType::X86, CpuType::Power, CpuType::Arm, CpuType::Riscv];
}

/// Service-level agreement class of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlaClass {
    /// 95% of tasks must meet their deadline
    Sla0,
    /// 90%
    Sla1,
    /// 80%
    Sla2,
    /// Best effort
    Sla3,
}

impl SlaClass {
    pub const ALL: [SlaClass; 4] = [SlaClass::Sla0, SlaClass::Sla1, SlaClass::Sla2, SlaClass::Sla3];

    /// Fraction of tasks of this class that must complete on time,
    /// `None` for best effort.
    pub fn target_fraction(self) -> Option<f64> {
        match self {
            SlaClass::Sla0 => Some(0.95),
            SlaClass::Sla1 => Some(0.90),
            SlaClass::Sla2 => Some(0.80),
            SlaClass::Sla3 => None,
        }
    }

    /// Default task priority derived from the SLA class.
    pub fn default_priority(self) -> Priority {
        match self {
            SlaClass::Sla0 => Priority::High,
            SlaClass::Sla1 => Priority::Mid,
            SlaClass::Sla2 | SlaClass::Sla3 => Priority::Low,
        }
    }
}

/// Per-core C-state (idle depth)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CpuState {
    C0,
    C1,
    C2,
    C4,
}

/// Per-core performance state. P0 is the fastest and hottest, P3 the
/// slowest and coolest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PState {
    P0,
    P1,
    P2,
    P3,
}

impl PState {
    /// Index into per-P-state capability tables (P0 = 0).
    pub fn index(self) -> usize {
        match self {
            PState::P0 => 0,
            PState::P1 => 1,
            PState::P2 => 2,
            PState::P3 => 3,
        }
    }

    /// P-state for a table index, clamped to P3.
    pub fn from_index(idx: usize) -> PState {
        match idx {
            0 => PState::P0,
            1 => PState::P1,
            2 => PState::P2,
            _ => PState::P3,
        }
    }
}

/// Machine-wide sleep state. S0 is running; deeper states draw less
/// power and wake more slowly; S5 is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MachineState {
    S0,
    S0i1,
    S1,
    S2,
    S3,
    S4,
    S5,
}

impl MachineState {
    /// Index into per-S-state power tables (S0 = 0).
    pub fn index(self) -> usize {
        match self {
            MachineState::S0 => 0,
            MachineState::S0i1 => 1,
            MachineState::S1 => 2,
            MachineState::S2 => 3,
            MachineState::S3 => 4,
            MachineState::S4 => 5,
            MachineState::S5 => 6,
        }
    }

    /// Only S0 machines can accept VM attachments and tasks.
    pub fn is_running(self) -> bool {
        self == MachineState::S0
    }
}

/// Point-in-time view of a physical machine, valid for the duration of
/// a single upcall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub machine_id: MachineId,
    pub cpu: CpuType,
    pub num_cores: u32,
    /// Memory capacity in MB
    pub memory_size: u64,
    /// Memory currently in use in MB
    pub memory_used: u64,
    pub gpus: bool,
    /// Per-core performance in MIPS at P0..P3
    pub performance: [u32; 4],
    /// Power draw in watts for S0..S5
    pub s_states: [u32; 7],
    /// Additional dynamic power draw in watts when busy at P0..P3
    pub p_states: [u32; 4],
    pub s_state: MachineState,
    pub p_state: PState,
    /// Energy consumed so far, in microjoules
    pub energy_consumed: u64,
    pub active_tasks: u32,
    pub active_vms: u32,
}

impl MachineInfo {
    /// Per-core MIPS at the machine's current P-state.
    pub fn current_mips(&self) -> u32 {
        self.performance[self.p_state.index()]
    }
}

/// Point-in-time view of a virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub vm_id: VmId,
    pub vm_type: VmOs,
    pub cpu: CpuType,
    /// Machine this VM is attached to; a freshly created VM is detached.
    pub machine_id: Option<MachineId>,
    pub active_tasks: Vec<TaskId>,
    pub migrating: bool,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub required_cpu: CpuType,
    pub required_vm: VmOs,
    /// Memory footprint in MB
    pub required_memory: u64,
    pub required_sla: SlaClass,
    pub arrival: SimTime,
    pub target_completion: SimTime,
    pub total_instructions: u64,
    pub remaining_instructions: u64,
    pub gpu_capable: bool,
    pub completed: bool,
    pub priority: Priority,
}

impl TaskInfo {
    /// MIPS the task must sustain to finish by its target completion
    /// time. One MIPS is one instruction per microsecond.
    pub fn mips_demand(&self) -> u64 {
        let span = self.target_completion.saturating_sub(self.arrival).max(1);
        (self.total_instructions / span).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_cpu_pairings() {
        for cpu in CpuType::ALL {
            assert!(VmOs::Linux.supported_on(cpu));
            assert!(VmOs::LinuxRt.supported_on(cpu));
        }
        assert!(VmOs::Win.supported_on(CpuType::X86));
        assert!(VmOs::Win.supported_on(CpuType::Arm));
        assert!(!VmOs::Win.supported_on(CpuType::Power));
        assert!(!VmOs::Win.supported_on(CpuType::Riscv));
        assert!(VmOs::Aix.supported_on(CpuType::Power));
        assert!(!VmOs::Aix.supported_on(CpuType::X86));
    }

    #[test]
    fn test_sla_default_priority() {
        assert_eq!(SlaClass::Sla0.default_priority(), Priority::High);
        assert_eq!(SlaClass::Sla1.default_priority(), Priority::Mid);
        assert_eq!(SlaClass::Sla2.default_priority(), Priority::Low);
        assert_eq!(SlaClass::Sla3.default_priority(), Priority::Low);
    }

    #[test]
    fn test_pstate_index_round_trip() {
        for p in [PState::P0, PState::P1, PState::P2, PState::P3] {
            assert_eq!(PState::from_index(p.index()), p);
        }
        // Out-of-range indices clamp to the slowest state
        assert_eq!(PState::from_index(9), PState::P3);
    }

    #[test]
    fn test_mips_demand() {
        let info = TaskInfo {
            task_id: TaskId(0),
            required_cpu: CpuType::X86,
            required_vm: VmOs::Linux,
            required_memory: 1024,
            required_sla: SlaClass::Sla1,
            arrival: 1_000_000,
            target_completion: 3_000_000,
            total_instructions: 4_000_000,
            remaining_instructions: 4_000_000,
            gpu_capable: false,
            completed: false,
            priority: Priority::Mid,
        };
        // 4M instructions over a 2-second window => 2 instructions/us
        assert_eq!(info.mips_demand(), 2);
    }
}
