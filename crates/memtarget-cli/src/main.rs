//! memtarget CLI: replay borrow/repay/spill scenarios against a task context.

use clap::{Parser, Subcommand};
use memtarget_core::config::MemoryConfig;
use memtarget_core::id::TaskId;
use memtarget_core::stats::StatsSnapshot;
use memtarget_mem::{targets, HostBackedTarget, MemoryTarget, TaskMemoryContext, TaskScopedTarget};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memtarget")]
#[command(about = "Replay task memory workloads against over-acquiring memory targets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a scenario from a YAML file
    Run {
        /// Path to the scenario YAML file
        #[arg(short, long)]
        scenario: PathBuf,

        /// Task capacity in bytes (overrides config)
        #[arg(long)]
        capacity: Option<i64>,

        /// Over-acquire ratio (overrides config)
        #[arg(long)]
        ratio: Option<f64>,

        /// Print the final stats tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a scenario without running it
    Validate {
        #[arg(short, long)]
        scenario: PathBuf,
    },
}

/// Scenario-level overrides of [`MemoryConfig`].
#[derive(Debug, Default, Deserialize)]
struct ScenarioConfig {
    task_capacity_bytes: Option<i64>,
    over_acquire_ratio: Option<f64>,
    throw_on_oom: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ConsumerSpec {
    name: String,
    /// Give memory back when the host asks.
    #[serde(default)]
    spillable: bool,
    /// Wrap in the over-acquire decorator using the configured ratio.
    #[serde(default = "default_true")]
    over_acquire: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    Borrow { consumer: String, bytes: i64 },
    Repay { consumer: String, bytes: i64 },
    Spill { consumer: String, bytes: i64 },
    Stats,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    config: ScenarioConfig,
    consumers: Vec<ConsumerSpec>,
    steps: Vec<Step>,
}

struct Report {
    lines: Vec<String>,
    stats: StatsSnapshot,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            capacity,
            ratio,
            json,
        } => {
            if let Err(e) = run_scenario(&scenario, capacity, ratio, json) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Validate { scenario } => {
            if let Err(e) = validate_scenario(&scenario) {
                eprintln!("Validation failed: {}", e);
                std::process::exit(1);
            }
            println!("✓ Scenario is valid");
        }
    }
}

fn run_scenario(
    path: &PathBuf,
    capacity: Option<i64>,
    ratio: Option<f64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = parse_scenario(&fs::read_to_string(path)?)?;

    let mut config = MemoryConfig::from_env();
    apply_scenario_config(&mut config, &scenario.config);
    if let Some(cap) = capacity {
        config.task_capacity_bytes = cap;
    }
    if let Some(r) = ratio {
        config.over_acquire_ratio = r;
    }

    let report = execute(&scenario, config)?;
    for line in &report.lines {
        println!("{line}");
    }
    if json {
        println!("{}", report.stats.to_json()?);
    } else {
        print!("{}", report.stats.pretty("task"));
    }
    Ok(())
}

fn validate_scenario(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = parse_scenario(&fs::read_to_string(path)?)?;
    check_references(&scenario)?;
    Ok(())
}

fn parse_scenario(yaml: &str) -> Result<Scenario, serde_yaml::Error> {
    serde_yaml::from_str(yaml)
}

fn apply_scenario_config(config: &mut MemoryConfig, scenario: &ScenarioConfig) {
    if let Some(cap) = scenario.task_capacity_bytes {
        config.task_capacity_bytes = cap;
    }
    if let Some(r) = scenario.over_acquire_ratio {
        config.over_acquire_ratio = r;
    }
    if let Some(t) = scenario.throw_on_oom {
        config.throw_on_oom = t;
    }
}

fn check_references(scenario: &Scenario) -> Result<(), String> {
    let mut names = std::collections::HashSet::new();
    for c in &scenario.consumers {
        if !names.insert(c.name.as_str()) {
            return Err(format!("duplicate consumer '{}'", c.name));
        }
    }
    for (i, step) in scenario.steps.iter().enumerate() {
        let consumer = match step {
            Step::Borrow { consumer, .. }
            | Step::Repay { consumer, .. }
            | Step::Spill { consumer, .. } => consumer,
            Step::Stats => continue,
        };
        if !names.contains(consumer.as_str()) {
            return Err(format!("step {i}: unknown consumer '{consumer}'"));
        }
    }
    Ok(())
}

/// A consumer's outermost target plus its leaf, kept for host-side spills.
struct Operator {
    leaf: Arc<HostBackedTarget>,
    target: Arc<dyn TaskScopedTarget>,
}

fn spill_everything_asked(target: &dyn MemoryTarget, size: i64) -> memtarget_core::error::Result<i64> {
    let held = target.used_bytes();
    if held == 0 {
        return Ok(0);
    }
    target.repay(size.min(held))
}

fn execute(
    scenario: &Scenario,
    config: MemoryConfig,
) -> Result<Report, Box<dyn std::error::Error>> {
    check_references(scenario)?;
    let ctx = TaskMemoryContext::new(TaskId::new(0), config)?;

    let mut operators = HashMap::new();
    for spec in &scenario.consumers {
        let spiller: Option<Box<dyn memtarget_mem::Spiller>> = if spec.spillable {
            Some(Box::new(spill_everything_asked))
        } else {
            None
        };
        let leaf = ctx.new_consumer(spec.name.clone(), spiller)?;
        let mut target: Arc<dyn TaskScopedTarget> = leaf.clone();
        if spec.over_acquire {
            target = targets::over_acquire(target, ctx.config().over_acquire_ratio)?;
        }
        if ctx.config().throw_on_oom {
            target = targets::throw_on_oom(target);
        }
        operators.insert(spec.name.clone(), Operator { leaf, target });
    }

    let mut lines = Vec::new();
    for step in &scenario.steps {
        let line = match step {
            Step::Borrow { consumer, bytes } => {
                let op = &operators[consumer];
                let granted = op.target.borrow(*bytes)?;
                format!(
                    "borrow {consumer} {bytes} -> granted {granted} (target {}, task {})",
                    op.target.used_bytes(),
                    ctx.used_bytes()
                )
            }
            Step::Repay { consumer, bytes } => {
                let op = &operators[consumer];
                let freed = op.target.repay(*bytes)?;
                format!(
                    "repay {consumer} {bytes} -> freed {freed} (target {}, task {})",
                    op.target.used_bytes(),
                    ctx.used_bytes()
                )
            }
            Step::Spill { consumer, bytes } => {
                let op = &operators[consumer];
                let freed = ctx
                    .manager()
                    .spill_consumer(op.leaf.consumer_id(), *bytes, None)?;
                format!(
                    "spill {consumer} {bytes} -> freed {freed} (target {}, task {})",
                    op.target.used_bytes(),
                    ctx.used_bytes()
                )
            }
            Step::Stats => ctx.stats().pretty("task").trim_end().to_string(),
        };
        tracing::info!("{line}");
        lines.push(line);
    }

    let stats = StatsSnapshot::merged(
        operators
            .values()
            .map(|op| (op.target.name(), op.target.stats())),
    );
    Ok(Report { lines, stats })
}
