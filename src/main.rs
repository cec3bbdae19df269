//! Binary entry point for the outpost CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use outpost::{ActionError, ActionInput, ActionSettings, BuildContext, ShellError, ShimError};

mod cli;

use cli::{Cli, RunCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error(transparent)]
    Shim(#[from] ShimError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            exit_code_for(&err)
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| CliError::InvalidCommand(String::from("no command given")))?;

    let settings = ActionSettings::load()?;
    let mut context = BuildContext::new(settings)?;
    if let Some(instance_type) = args.instance_type {
        context = context.with_instance_type(instance_type);
    }
    if let Some(image) = args.image {
        context = context.with_image(image);
    }
    if args.echo {
        context = context.with_echoed_output();
    }

    let action = context.action(program, rest);
    let targets: Vec<Utf8PathBuf> = args.targets.iter().map(Utf8PathBuf::from).collect();
    let mut sources: Vec<ActionInput> = args
        .sources
        .iter()
        .map(|path| ActionInput::File(Utf8PathBuf::from(path)))
        .collect();
    sources.extend(args.values.into_iter().map(ActionInput::Value));

    context.run_action(&action, &targets, &sources).await?;
    Ok(0)
}

/// Maps a failure onto the process exit code, forwarding the remote or local
/// command's own exit code when one is known.
fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Shim(ShimError::Action(ActionError::Execute(
            ShellError::RemoteExecution {
                status: Some(code), ..
            },
        )))
        | CliError::Shim(ShimError::LocalExecution { code: Some(code) }) => *code,
        _ => 1,
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

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_args_rejects_control_characters() {
        let err = validate_command_args(&[String::from("echo\tbad")])
            .expect_err("tab should be rejected");

        assert!(
            matches!(err, CliError::InvalidCommand(ref message) if message.contains("control characters")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_command_args_accepts_safe_arguments() {
        assert!(validate_command_args(&[String::from("echo"), String::from("ok")]).is_ok());
    }

    #[test]
    fn exit_code_forwards_the_remote_status() {
        let err = CliError::Shim(ShimError::Action(ActionError::Execute(
            ShellError::RemoteExecution {
                command: String::from("cc main.c"),
                status: Some(7),
                stdout: String::new(),
                stderr: String::new(),
            },
        )));
        assert_eq!(exit_code_for(&err), 7);
    }

    #[test]
    fn exit_code_defaults_to_one() {
        let err = CliError::InvalidCommand(String::from("bad"));
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::InvalidCommand(String::from("bad"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("invalid command argument"),
            "rendered: {rendered}"
        );
    }
}
