//! ampliflow CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Full batch, continuing past failed samples
//! ampliflow --configfile config.yaml --cores 16 --keep-going
//!
//! # Batch summary only
//! ampliflow postprocess --configfile config.yaml
//!
//! # Preview the plan
//! ampliflow all postprocess --configfile config.yaml --dry-run
//!
//! # Stop scheduling new nodes once /tmp/stop exists
//! ampliflow --configfile config.yaml --abort-flag /tmp/stop
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use colored::Colorize;
use log::{error, info, warn};

use ampliflow::config::{RunConfig, SampleTable};
use ampliflow::error::{Error, PlanningError};
use ampliflow::execution::{Engine, RunReport, RunResult};
use ampliflow::postprocess::{Aggregator, NcovToolsSetup};
use ampliflow::workflow::{PlanPolicy, RuleGraphBuilder, StageRegistry};
use ampliflow::{APP_NAME, VERSION};

/// Multi-sample amplicon sequencing workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "ampliflow", version)]
struct Cli {
    /// Targets to run, in order: all, postprocess, ncov_tools
    #[arg(default_value = "all")]
    targets: Vec<String>,

    /// Run configuration file
    #[arg(long, default_value = "config.yaml")]
    configfile: PathBuf,

    /// Worker budget shared by running nodes (default: all CPUs)
    #[arg(long, short = 'c')]
    cores: Option<usize>,

    /// Keep running nodes that do not depend on a failed node
    #[arg(long, short = 'k')]
    keep_going: bool,

    /// Print the plan without executing anything
    #[arg(long, short = 'n')]
    dry_run: bool,

    /// Rerun nodes even when their outputs are up to date
    #[arg(long)]
    force: bool,

    /// Stop scheduling new nodes once this file exists
    #[arg(long)]
    abort_flag: Option<PathBuf>,

    /// Record `<tool> --version` in the version manifest
    #[arg(long)]
    probe_versions: bool,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    All,
    Postprocess,
    NcovTools,
}

impl FromStr for Target {
    type Err = PlanningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Target::All),
            "postprocess" => Ok(Target::Postprocess),
            "ncov_tools" => Ok(Target::NcovTools),
            other => Err(PlanningError::UnknownTarget(other.to_string())),
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Amplicon Sequencing Workflow Orchestrator");
    println!();
}

fn print_run_summary(report: &RunReport) {
    println!();
    println!("{}", "Run summary".bold());
    println!("  {:<22}{}", "succeeded:", report.successes().to_string().green());
    println!(
        "  {:<22}{}",
        "placeholder outputs:",
        report.placeholders().to_string().yellow()
    );
    println!("  {:<22}{}", "failed:", report.failures().to_string().red());
    println!("  {:<22}{}", "not run:", report.not_run().to_string().red());
    println!("  {:<22}{:.2?}", "elapsed:", report.elapsed);

    for (id, result) in &report.results {
        match result {
            RunResult::Failure { reason } => {
                let first_line = reason.lines().next().unwrap_or_default();
                println!("  {} {}: {}", "x".red(), id, first_line);
            }
            RunResult::FailureWithPlaceholder { .. } => {
                println!("  {} {}: placeholder outputs", "~".yellow(), id);
            }
            _ => {}
        }
    }
}

/// Plans and executes the full batch. Returns false if any node failed or
/// did not run.
fn run_batch(cli: &Cli, config: &RunConfig, samples: &SampleTable) -> Result<bool, Error> {
    let policy = PlanPolicy::decide(config, samples)?;
    let registry = StageRegistry::standard(config);
    let plan = RuleGraphBuilder::new(&registry, samples, policy).build_default()?;

    info!(
        "Plan: {} nodes, {} edges for {} samples",
        plan.len(),
        plan.edges.len(),
        samples.len()
    );

    let mut engine = Engine::new(&plan, &config.result_dir);
    engine.set_run_name(config.run_name());
    engine.set_keep_going(cli.keep_going);
    engine.set_dry_run(cli.dry_run);
    engine.set_force(cli.force);
    if let Some(cores) = cli.cores {
        engine.set_max_workers(cores);
    }
    if let Some(flag) = &cli.abort_flag {
        info!("Abort control: {}", flag.display());
        engine.set_abort_flag_path(flag);
    }

    let report = engine.run()?;

    if !report.dry_run {
        print_run_summary(&report);
        println!("{}", report.timeline.gantt_chart());
    }

    Ok(report.is_success())
}

fn run_postprocess(cli: &Cli, config: &RunConfig, samples: &SampleTable) -> Result<(), Error> {
    if cli.dry_run {
        info!("[DRY RUN] postprocess would write the batch summary and version manifest");
        return Ok(());
    }

    let report = Aggregator::new(config, samples)
        .with_tool_probing(cli.probe_versions)
        .run()?;

    let incomplete = report.incomplete_samples();
    if incomplete.is_empty() {
        println!("{} all {} samples complete", "✓".green(), report.summaries.len());
    } else {
        println!(
            "{} {} of {} samples incomplete: {}",
            "!".yellow(),
            incomplete.len(),
            report.summaries.len(),
            incomplete.join(", ")
        );
    }
    println!("Summary: {}", report.summary_path.display());
    println!("Versions: {}", report.manifest_path.display());
    Ok(())
}

fn run_ncov_tools(cli: &Cli, config: &RunConfig, samples: &SampleTable) -> Result<bool, Error> {
    let cores = cli.cores.unwrap_or_else(num_cpus::get);
    let setup = NcovToolsSetup::new(config, samples, cores);

    if cli.dry_run {
        info!("[DRY RUN] ncov_tools would stage outputs and run with {} cores", cores);
        return Ok(true);
    }

    match setup.run()? {
        Some(RunResult::Failure { reason }) => {
            error!("ncov-tools failed: {}", reason);
            Ok(false)
        }
        Some(_) => {
            info!("ncov-tools completed");
            Ok(true)
        }
        None => Ok(true),
    }
}

/// Returns whether every target completed without failed nodes.
fn run(cli: &Cli) -> Result<bool, Error> {
    let targets = cli
        .targets
        .iter()
        .map(|t| t.parse::<Target>())
        .collect::<Result<Vec<_>, _>>()?;

    let config = RunConfig::load(&cli.configfile)?;
    let samples = SampleTable::load(&config.samples)?;
    info!(
        "Loaded {} samples ({:?} run) from {}",
        samples.len(),
        samples.shape(),
        config.samples.display()
    );

    if cli.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    let mut success = true;
    for target in targets {
        info!("Target: {:?}", target);
        match target {
            Target::All => success &= run_batch(cli, &config, &samples)?,
            Target::Postprocess => run_postprocess(cli, &config, &samples)?,
            Target::NcovTools => success &= run_ncov_tools(cli, &config, &samples)?,
        }
    }

    if !success {
        warn!("Some nodes failed or did not run; consult the summary report");
    }
    Ok(success)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    print_banner();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
