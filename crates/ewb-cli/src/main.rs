//! EWB case runner
//!
//! The `ewb-run` command evaluates one or more forecast models against every
//! case of an event type, falling back to secondary archives where the
//! primary has no data and checkpointing each model as it finishes.
//!
//! Models are selected with one `--run_<model>` flag per registry entry, so
//! the flag set depends on the config file in use.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{
    value_parser, Arg, ArgAction, ArgMatches, Command, CommandFactory, FromArgMatches, Parser,
};
use tracing::{info, warn, Level};

use ewb_core::{
    BatchReport, CaseCollection, CheckpointStore, CommandEvaluator, CommandOpener, Config,
    ConfigurationError, Driver, EventType, ModelRegistry, SourceResolver,
};

#[derive(Parser, Debug)]
#[command(name = "ewb-run")]
#[command(author = "EWB Paper Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluate forecast models over Extreme Weather Bench cases", long_about = None)]
struct Cli {
    /// Event type to evaluate (heat_wave, freeze, severe_convection,
    /// atmospheric_river, tropical_cyclone)
    #[arg(long, value_name = "EVENT_TYPE")]
    event_type: EventType,

    /// Config file (default: ./config.toml, then ~/.config/ewb/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Checkpoint directory (default: <basepath>/saved_data)
    #[arg(long, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// Maximum cases in flight per source
    #[arg(long, value_name = "N")]
    n_jobs: Option<usize>,

    /// Recompute models that already have a checkpoint
    #[arg(long)]
    no_resume: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn run_flag(model: &str) -> String {
    format!("run_{model}")
}

/// The derive parser plus one `--run_<model>` switch per registry entry.
fn command(registry: &ModelRegistry) -> Command {
    registry.names().fold(Cli::command(), |cmd, name| {
        let display = registry
            .get(name)
            .ok()
            .and_then(|entry| entry.sources.first())
            .map(|source| source.display_name.clone())
            .unwrap_or_else(|| name.to_string());
        cmd.arg(
            Arg::new(run_flag(name))
                .long(run_flag(name))
                .action(ArgAction::SetTrue)
                .help_heading("Models")
                .help(format!("Evaluate {display}")),
        )
    })
}

fn selected_models(registry: &ModelRegistry, matches: &ArgMatches) -> Vec<String> {
    registry
        .names()
        .filter(|name| matches.get_flag(&run_flag(name)))
        .map(str::to_string)
        .collect()
}

/// `--config` has to be known before the full command line can be parsed,
/// since the model flags come from the configured registry. Everything
/// else is swallowed by a catch-all positional.
fn config_arg(args: &[String]) -> Option<PathBuf> {
    Command::new("ewb-run")
        .ignore_errors(true)
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("rest")
                .num_args(0..)
                .action(ArgAction::Append)
                .allow_hyphen_values(true),
        )
        .try_get_matches_from(args)
        .ok()?
        .get_one::<PathBuf>("config")
        .cloned()
}

/// Exit status for a fatal error: 2 for configuration problems, 1 otherwise.
fn exit_code(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<ConfigurationError>().is_some() {
        2
    } else {
        1
    }
}

async fn run(args: Vec<String>) -> Result<BatchReport> {
    let config = Config::load(config_arg(&args).as_deref()).context("Failed to load config")?;
    let registry = config.registry()?;

    let matches = command(&registry)
        .try_get_matches_from(&args)
        .unwrap_or_else(|e| e.exit());
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ewb_core::init_tracing(cli.json, level);

    let models = selected_models(&registry, &matches);
    if models.is_empty() {
        command(&registry)
            .error(
                ErrorKind::MissingRequiredArgument,
                "select at least one model with --run_<model>",
            )
            .exit();
    }

    for model in &models {
        registry.resolve(model, cli.event_type)?;
        registry.verify_credentials(model)?;
    }

    let catalog_path = config.catalog_path();
    let catalog = CaseCollection::load_json(&catalog_path).context("Failed to load case catalog")?;
    let evaluations = config.evaluations_for(cli.event_type)?;
    let evaluator = config
        .evaluator
        .clone()
        .ok_or(ConfigurationError::MissingEvaluator)?;

    let mut parallel = config.parallel.clone();
    if let Some(n_jobs) = cli.n_jobs {
        parallel.n_jobs = n_jobs;
    }
    let output_dir = cli.output_dir.unwrap_or_else(|| config.output_dir());

    info!(
        event_type = %cli.event_type,
        models = ?models,
        cases = catalog.len(),
        catalog = %catalog_path.display(),
        output_dir = %output_dir.display(),
        config = ?config.source(),
        "starting ewb-run"
    );

    let resolver = Arc::new(SourceResolver::new(
        Arc::new(registry),
        Arc::new(CommandOpener::new(config.opener.handshake.clone())),
    ));
    let driver = Driver::new(
        resolver,
        Arc::new(CommandEvaluator::new(evaluator)),
        CheckpointStore::new(output_dir),
        catalog,
        evaluations,
    )
    .with_parallel(parallel)
    .with_resume(!cli.no_resume);

    let report = driver.run_batch(&models, cli.event_type).await?;
    for unit in report.failed() {
        warn!(
            model = %unit.model,
            error = unit.error.as_deref().unwrap_or("unknown"),
            "model run failed"
        );
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let result = run(args).await.and_then(|report| {
        let json = serde_json::to_string_pretty(&report).context("Failed to encode batch report")?;
        println!("{json}");
        Ok(())
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
