//! Binary entry point for the node e2e runner CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio::sync::mpsc::unbounded_channel;
use tracing_subscriber::EnvFilter;

use node_e2e_runner::{
    RunnerConfig, RunnerError, RunnerRegistry, SshConfig, TestOutcome, config::ConfigError,
    remote::RemoteExecError,
};

mod cli;

use cli::{Cli, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("ssh configuration error: {0}")]
    Ssh(#[from] RemoteExecError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let config = apply_overrides(RunnerConfig::load_without_cli_args()?, &args);
    let ssh = SshConfig::load_without_cli_args()?;

    let mut runner = RunnerRegistry::with_builtin().create(&args.runner, config, ssh)?;
    runner.validate().await?;

    let (sender, mut receiver) = unbounded_channel();
    let expected = runner.start_tests(&args.command, &sender)?;
    drop(sender);

    let mut outcomes = Vec::with_capacity(expected);
    while outcomes.len() < expected {
        let Some(outcome) = receiver.recv().await else {
            break;
        };
        write_outcome(io::stdout(), &outcome);
        outcomes.push(outcome);
    }

    let failed = write_summary(io::stdout(), expected, &outcomes);
    Ok(i32::from(failed))
}

fn apply_overrides(config: RunnerConfig, args: &RunCommand) -> RunnerConfig {
    RunnerConfig {
        image_config_file: args.image_config_file.clone().or(config.image_config_file),
        images: args.images.clone().or(config.images),
        image_project: args.image_project.clone().or(config.image_project),
        instance_type: args
            .instance_type
            .clone()
            .unwrap_or(config.instance_type),
        delete_instances: config.delete_instances && !args.keep_instances,
        ..config
    }
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn write_outcome(mut target: impl Write, outcome: &TestOutcome) {
    let host = outcome.host.as_deref().unwrap_or("<no instance>");
    writeln!(target, ">>> {} on {host}", outcome.image).ok();
    if let Some(description) = &outcome.description {
        writeln!(target, "    {description}").ok();
    }
    if !outcome.output.is_empty() {
        write!(target, "{}", outcome.output).ok();
        if !outcome.output.ends_with('\n') {
            writeln!(target).ok();
        }
    }
    match &outcome.error {
        None => writeln!(target, "<<< {}: PASS", outcome.image).ok(),
        Some(err) => writeln!(target, "<<< {}: FAIL: {err}", outcome.image).ok(),
    };
}

/// Writes the final tally and returns `true` when any image failed.
fn write_summary(mut target: impl Write, expected: usize, outcomes: &[TestOutcome]) -> bool {
    let passed = outcomes.iter().filter(|outcome| outcome.exit_ok()).count();
    let missing = expected.saturating_sub(outcomes.len());
    writeln!(
        target,
        "{passed} of {expected} images passed{}",
        if missing == 0 {
            String::new()
        } else {
            format!(" ({missing} never reported)")
        }
    )
    .ok();
    passed != expected
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
