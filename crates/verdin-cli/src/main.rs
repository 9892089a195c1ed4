//! Verdin CLI
//!
//! Runs one or more scheduling policies against a simulated cluster and
//! workload, prints the per-run report, and optionally dumps results as
//! JSON for comparison.

use std::fs;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use verdin_core::CpuType;
use verdin_engine::{PolicyConfig, PolicyKind};
use verdin_sim::{
    ClusterSpec, Simulation, SimulationResult, TaskSpec, WorkloadConfig, WorkloadGenerator,
};

#[derive(Parser, Debug)]
#[command(name = "verdin")]
#[command(about = "Simulate energy-aware cluster scheduling policies", long_about = None)]
struct Args {
    /// Policies to run (comma-separated:
    /// greedy,tier,predictive,firstfit,utilsort)
    #[arg(short, long, default_value = "greedy")]
    policies: String,

    /// Number of machines in the uniform cluster
    #[arg(short, long, default_value_t = 16)]
    machines: u32,

    /// CPU family of the uniform cluster (x86, power, arm, riscv)
    #[arg(long, default_value = "x86")]
    cpu: String,

    /// Cluster description file (JSON); overrides --machines/--cpu
    #[arg(long)]
    cluster: Option<String>,

    /// Number of generated tasks
    #[arg(short, long, default_value_t = 64)]
    tasks: usize,

    /// Workload generator seed
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Workload file (JSON); overrides the generator
    #[arg(short, long)]
    workload: Option<String>,

    /// Output JSON file for the results
    #[arg(short, long)]
    output: Option<String>,
}

fn parse_cpu(s: &str) -> Result<CpuType> {
    match s.to_ascii_lowercase().as_str() {
        "x86" => Ok(CpuType::X86),
        "power" => Ok(CpuType::Power),
        "arm" => Ok(CpuType::Arm),
        "riscv" => Ok(CpuType::Riscv),
        other => bail!("unknown cpu family: {other}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();

    let cluster = match &args.cluster {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading cluster file {path}"))?;
            serde_json::from_str::<ClusterSpec>(&raw)
                .with_context(|| format!("parsing cluster file {path}"))?
        }
        None => ClusterSpec::uniform(args.machines, parse_cpu(&args.cpu)?),
    };

    let workload: Vec<TaskSpec> = match &args.workload {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading workload file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing workload file {path}"))?
        }
        None => {
            let config = WorkloadConfig {
                tasks: args.tasks,
                seed: args.seed,
                cpu_mix: vec![(parse_cpu(&args.cpu)?, 1.0)],
                ..WorkloadConfig::default()
            };
            WorkloadGenerator::new(config).generate()
        }
    };
    info!(
        machines = cluster.machine_specs().len(),
        tasks = workload.len(),
        "inputs ready"
    );

    let mut results: Vec<SimulationResult> = Vec::new();
    for name in args.policies.split(',').map(str::trim) {
        let policy = match PolicyKind::from_str(name) {
            Ok(p) => p,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        println!("== {policy} ==");
        let mut sim = Simulation::new(policy, PolicyConfig::default(), &cluster, &workload)?;
        let result = sim.run()?;
        println!();
        results.push(result);
    }

    if results.is_empty() {
        bail!("no runnable policy among: {}", args.policies);
    }

    println!(
        "{:<12} {:>10} {:>12} {:>10} {:>10} {:>10} {:>12}",
        "Policy", "Completed", "Energy(kWh)", "SLA0%", "SLA1%", "SLA2%", "Migrations"
    );
    println!("{}", "-".repeat(82));
    for r in &results {
        println!(
            "{:<12} {:>7}/{:<2} {:>12.3} {:>10.2} {:>10.2} {:>10.2} {:>12}",
            r.policy,
            r.completed_tasks,
            r.total_tasks,
            r.total_energy_kwh,
            r.sla_violation_pct[0],
            r.sla_violation_pct[1],
            r.sla_violation_pct[2],
            r.stats.migrations_completed,
        );
    }

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&results)?;
        fs::write(path, json).with_context(|| format!("writing results to {path}"))?;
        println!("\nResults saved to {path}");
    }

    Ok(())
}
