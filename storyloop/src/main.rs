//! Story iteration loop.
//!
//! Drives a coding agent through the stories of a requirements document, one
//! story per iteration, and reports progress as JSON lines on stdout.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use storyloop::exit_codes;
use storyloop::io::claude::ClaudeCli;
use storyloop::io::config::{
    CONFIG_FILE_NAME, RunConfig, RunnerConfig, load_config, read_system_prompt,
};
use storyloop::io::emitter::{EmitError, Emitter};
use storyloop::logging;
use storyloop::run::{RunFailed, RunSummary, run_loop};
use storyloop::select::{SelectOutcome, select_from_path, status_from_path};

#[derive(Parser, Debug)]
#[command(
    name = "storyloop",
    version,
    about = "Drive a coding agent through a story backlog, one story per iteration"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the iteration loop and stream JSONL events.
    Run(RunArgs),
    /// Print the id of the next story (exit 2 when every story passes).
    Select {
        /// Requirements document (JSON).
        #[arg(long)]
        prd: PathBuf,
    },
    /// Print progress and the next story.
    Status {
        /// Requirements document (JSON).
        #[arg(long)]
        prd: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory the agent works in.
    #[arg(long)]
    project_dir: PathBuf,
    /// Requirements document (JSON).
    #[arg(long)]
    prd: PathBuf,
    /// Identifier echoed in run events.
    #[arg(long)]
    run_id: String,
    /// Upper bound on iterations.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: u32,
    /// File replacing the default agent instruction preamble.
    #[arg(long)]
    system_prompt: Option<PathBuf>,
    /// Runner settings (defaults to `<project-dir>/.storyloop.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Append events to this file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => std::process::exit(report_parse_error(&err)),
    };

    let code = match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Select { prd } => cmd_select(&prd),
        Command::Status { prd } => cmd_status(&prd),
    };
    std::process::exit(code);
}

/// Print clap's usage or help output and pick the exit code.
///
/// Usage errors are `INVALID`; `--help` and `--version` succeed.
fn report_parse_error(err: &clap::Error) -> i32 {
    if let Err(print_err) = err.print() {
        error!(error = %print_err, kind = ?err.kind(), "could not print command-line output");
    }
    if err.use_stderr() {
        exit_codes::INVALID
    } else {
        exit_codes::OK
    }
}

fn cmd_run(args: &RunArgs) -> i32 {
    let prepared = prepare_run(args).and_then(|(config, runner)| {
        let out = open_output(args.output.as_deref())?;
        Ok((config, runner, out))
    });
    let (config, runner, out) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            error!(error = %format!("{err:#}"), "cannot start run");
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };

    match execute_run(&config, &runner, out) {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                iterations = summary.iterations,
                stories_completed = summary.stories_completed,
                stop = ?summary.stop,
                "run finished"
            );
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    }
}

/// Resolve and validate everything a run needs. Nothing is emitted on failure.
fn prepare_run(args: &RunArgs) -> Result<(RunConfig, RunnerConfig)> {
    let config_path = match &args.config {
        Some(path) if !path.is_file() => bail!("config file {} does not exist", path.display()),
        Some(path) => path.clone(),
        None => args.project_dir.join(CONFIG_FILE_NAME),
    };
    let runner = load_config(&config_path)?;
    let credential = runner.find_credential(|name| std::env::var(name).ok())?;
    debug!(credential, "agent credential present");

    let config = RunConfig {
        run_id: args.run_id.clone(),
        project_dir: args.project_dir.clone(),
        prd_path: args.prd.clone(),
        max_iterations: args.max_iterations,
        system_prompt: read_system_prompt(args.system_prompt.as_deref())?,
    };
    config.validate()?;
    Ok((config, runner))
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    let Some(path) = path else {
        return Ok(Box::new(io::stdout()));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open event output {}", path.display()))?;
    Ok(Box::new(file))
}

fn execute_run(
    config: &RunConfig,
    runner: &RunnerConfig,
    out: Box<dyn Write>,
) -> Result<RunSummary> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current iteration");
                interrupt.cancel();
            }
        });

        let agent = ClaudeCli::from_config(&runner.agent);
        let mut emitter = Emitter::new(out);
        run_loop(config, runner, &agent, &mut emitter, &cancel).await
    })
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<RunFailed>().is_some() {
        exit_codes::RUN_FAILED
    } else if err.downcast_ref::<EmitError>().is_some() {
        exit_codes::OUTPUT_FAILED
    } else {
        exit_codes::INVALID
    }
}

fn cmd_select(prd: &Path) -> i32 {
    match select_from_path(prd) {
        Ok(SelectOutcome::Open(story)) => {
            println!("{}", story.id);
            exit_codes::OK
        }
        Ok(SelectOutcome::Complete) => exit_codes::COMPLETE,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    }
}

fn cmd_status(prd: &Path) -> i32 {
    match status_from_path(prd) {
        Ok(report) => {
            println!("{}", report.render());
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    }
}
