//! Command-line interface definitions for the `node-e2e-runner` binary.
//!
//! The parser structures live here so both the binary and the build script
//! can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `node-e2e-runner` binary.
#[derive(Debug, Parser)]
#[command(
    name = "node-e2e-runner",
    about = "Provision throwaway cloud instances and run node e2e tests on them",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision one instance per image and run a command on each.
    #[command(
        name = "run",
        about = "Provision one instance per image and run a command on each"
    )]
    Run(RunCommand),
}

/// Arguments for the `node-e2e-runner run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Runner backend to use.
    #[arg(long, value_name = "NAME", default_value = "gce")]
    pub(crate) runner: String,
    /// Image configuration YAML file, relative to the image config directory.
    #[arg(long, value_name = "PATH")]
    pub(crate) image_config_file: Option<String>,
    /// Comma-separated list of images to test.
    #[arg(long, value_name = "IMAGES")]
    pub(crate) images: Option<String>,
    /// Project the bare `--images` are looked up in.
    #[arg(long, value_name = "PROJECT")]
    pub(crate) image_project: Option<String>,
    /// Override the machine type for images without their own.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Keep instances after the tests finish.
    #[arg(long)]
    pub(crate) keep_instances: bool,
    /// Command to execute on every instance (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
