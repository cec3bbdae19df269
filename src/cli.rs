//! Command-line interface definitions for the `outpost` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `outpost` binary.
#[derive(Debug, Parser)]
#[command(
    name = "outpost",
    about = "Run one build action on an ephemeral Scaleway instance",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision, stage, execute, fetch, and tear down.
    #[command(name = "run", about = "Provision, stage, execute, fetch, and tear down")]
    Run(RunCommand),
}

/// Arguments for the `outpost run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Override the Scaleway instance type (commercial type) for this run.
    ///
    /// The provisioner validates availability in the selected zone during
    /// provisioning and rejects unknown values with a provider-specific
    /// error.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Override the image label for this run.
    ///
    /// The provisioner resolves the label to a concrete image identifier for
    /// the selected architecture and zone.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Local source file staged into the remote workspace before execution.
    /// May be given multiple times; staging preserves the given order.
    #[arg(long = "source", value_name = "PATH")]
    pub(crate) sources: Vec<String>,
    /// Computed value appended to the remote command line literally instead
    /// of being uploaded. May be given multiple times.
    #[arg(long = "value", value_name = "VALUE")]
    pub(crate) values: Vec<String>,
    /// Local target file fetched back once the command succeeds. At least
    /// one target is required.
    #[arg(long = "target", value_name = "PATH", required = true)]
    pub(crate) targets: Vec<String>,
    /// Replay the remote command's output instead of suppressing it.
    #[arg(long)]
    pub(crate) echo: bool,
    /// Command to execute on the remote host (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
