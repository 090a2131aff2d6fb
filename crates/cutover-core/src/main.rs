//! `cutover` command-line interface

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use cutover_core::{
    demo_plan, FileRunStore, MemoryRunStore, MigrationOrchestrator, MigrationPlan,
    MigrationReport, RunStore, Simulation, SimulatorConfig,
};
use cutover_traffic::{abort_pair, RunOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("cutover")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Blue/green migration orchestrator")
        .subcommand_required(true)
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Default filter when RUST_LOG is unset"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a migration against simulated infrastructure")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("degrade-at")
                        .long("degrade-at")
                        .value_parser(value_parser!(u8).range(1..=100))
                        .help("New-environment share (%) at which its error rate spikes"),
                )
                .arg(
                    Arg::new("provision-failure-rate")
                        .long("provision-failure-rate")
                        .default_value("0")
                        .value_parser(value_parser!(f64))
                        .help("Probability that one provisioning attempt fails"),
                )
                .arg(
                    Arg::new("plan")
                        .long("plan")
                        .value_parser(value_parser!(PathBuf))
                        .help("Plan file (TOML); defaults to the built-in demo plan"),
                )
                .arg(
                    Arg::new("state-dir")
                        .long("state-dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Persist runs here and resume from them; in-memory otherwise"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the final report as JSON"),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Check a plan file without running it")
                .arg(
                    Arg::new("plan")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Plan file (TOML)"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Show the persisted run of a plan")
                .arg(
                    Arg::new("state-dir")
                        .long("state-dir")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory holding run records"),
                )
                .arg(Arg::new("name").required(true).help("Plan name")),
        )
}

fn init_tracing(matches: &ArgMatches) {
    let level = matches
        .get_one::<String>("log-level")
        .map_or("info", String::as_str);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if matches.get_one::<String>("log-format").map(String::as_str) == Some("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(&matches);

    let result = match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("validate", args)) => validate(args),
        Some(("inspect", args)) => inspect(args).await,
        _ => Ok(ExitCode::FAILURE),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn simulate(args: &ArgMatches) -> Result<ExitCode> {
    let plan = match args.get_one::<PathBuf>("plan") {
        Some(path) => MigrationPlan::from_path(path)
            .with_context(|| format!("loading plan {}", path.display()))?,
        None => demo_plan().context("building demo plan")?,
    };
    let config = SimulatorConfig {
        seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
        degrade_at: args.get_one::<u8>("degrade-at").copied(),
        provision_failure_rate: args
            .get_one::<f64>("provision-failure-rate")
            .copied()
            .unwrap_or(0.0),
        ..SimulatorConfig::default()
    };
    anyhow::ensure!(
        (0.0..=1.0).contains(&config.provision_failure_rate),
        "--provision-failure-rate must be within [0, 1]"
    );

    let store: Arc<dyn RunStore> = match args.get_one::<PathBuf>("state-dir") {
        Some(dir) => Arc::new(FileRunStore::new(dir)),
        None => Arc::new(MemoryRunStore::new()),
    };

    let (abort, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort("interrupted by operator");
        }
    });

    tracing::info!(plan = %plan.name, seed = config.seed, degrade_at = ?config.degrade_at, "simulation starting");
    let sim = Simulation::new(config);
    let orchestrator = MigrationOrchestrator::new(sim.collaborators(), store).with_abort(signal);
    match orchestrator.run(&plan).await {
        Ok(report) => {
            print_report(&report, args.get_flag("json"))?;
            Ok(exit_code(report.outcome()))
        }
        Err(err) => {
            for (stack, status) in orchestrator.stack_statuses() {
                eprintln!("  {:<16} {status}", stack.as_str());
            }
            Err(err).context("migration failed")
        }
    }
}

fn validate(args: &ArgMatches) -> Result<ExitCode> {
    let path = args
        .get_one::<PathBuf>("plan")
        .context("plan path is required")?;
    let plan = MigrationPlan::from_path(path)
        .with_context(|| format!("validating {}", path.display()))?;
    let order = plan.graph()?.topological_order()?;

    println!("plan {} is valid", plan.name);
    println!("provisioning order:");
    for (i, id) in order.iter().enumerate() {
        println!("  {:>2}. {id}", i + 1);
    }
    println!("phases:");
    for phase in plan.phases.iter() {
        println!(
            "  {:<12} {}  dwell {:?}  lag < {:?}  errors < {:.2}%",
            phase.name,
            phase.weight,
            phase.min_dwell,
            phase.max_lag,
            phase.max_error_rate * 100.0
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn inspect(args: &ArgMatches) -> Result<ExitCode> {
    let dir = args
        .get_one::<PathBuf>("state-dir")
        .context("--state-dir is required")?;
    let name = args.get_one::<String>("name").context("plan name is required")?;
    let store = FileRunStore::new(dir);
    match store.load(name).await? {
        Some(run) => {
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("no run recorded for {name} in {}", dir.display());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_report(report: &MigrationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{}", report.run.summary());
    println!("final weight: {}", report.final_weight());
    if !report.routing_in_sync {
        println!("warning: load balancer did not acknowledge the final weight");
    }
    if let Some(rollback) = &report.run.rollback {
        println!(
            "rolled back during {} ({}): {}",
            rollback.phase_name, rollback.phase_index, rollback.reason
        );
    }
    if let Some(failure) = &report.run.failed_stack {
        println!("stack {} failed: {}", failure.stack, failure.reason);
    }
    for (stack, status) in &report.stacks {
        println!("  {:<16} {status}", stack.as_str());
    }
    Ok(())
}

fn exit_code(outcome: Option<RunOutcome>) -> ExitCode {
    match outcome {
        Some(RunOutcome::Completed) => ExitCode::SUCCESS,
        Some(RunOutcome::RolledBack) => ExitCode::from(2),
        Some(RunOutcome::Aborted) | None => ExitCode::from(3),
    }
}
