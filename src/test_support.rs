//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::backend::{
    InstanceHandle, InstanceNetworking, InstanceRequest, Provisioner, ProvisionerFuture,
};
use crate::shell::{CommandOutput, CommandRunner, ShellError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes `count` successful exit statuses.
    pub fn push_successes(&self, count: usize) {
        for _ in 0..count {
            self.push_success();
        }
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(&self, code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ShellError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| ShellError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Command runner that executes the remote half of the protocol against a
/// local directory.
///
/// SSH invocations run their command string through `sh` with the loopback
/// root as working directory, and transfers become plain file copies, so the
/// full stage/execute/fetch/scrub pipeline can be exercised end to end
/// without a network.
#[derive(Clone, Debug)]
pub struct LoopbackRunner {
    root: Utf8PathBuf,
}

impl LoopbackRunner {
    /// Creates a runner rooted at `root`, the directory standing in for the
    /// remote host's working directory.
    #[must_use]
    pub const fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn run_ssh(&self, args: &[OsString]) -> Result<CommandOutput, ShellError> {
        let rendered: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        // Control master setup and teardown carry no remote command.
        if rendered.iter().any(|arg| arg == "-M" || arg == "-O") {
            return Ok(success());
        }

        let command = rendered.last().cloned().unwrap_or_default();
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(self.root.as_std_path())
            .output()
            .map_err(|err| ShellError::Spawn {
                program: String::from("sh"),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_scp(&self, args: &[OsString]) -> CommandOutput {
        let operands = positional_operands(args);
        let [source, destination] = operands.as_slice() else {
            return failure(format!("expected two operands, got {operands:?}"));
        };

        let from = self.resolve(source);
        let to = self.resolve(destination);
        match std::fs::copy(&from, &to) {
            Ok(_) => success(),
            Err(err) => failure(format!("copy {from} -> {to}: {err}")),
        }
    }

    fn resolve(&self, operand: &str) -> Utf8PathBuf {
        operand
            .split_once(':')
            .filter(|(host, _)| host.contains('@'))
            .map_or_else(
                || Utf8PathBuf::from(operand),
                |(_, remote)| self.root.join(remote),
            )
    }
}

fn positional_operands(args: &[OsString]) -> Vec<String> {
    let mut operands = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let text = arg.to_string_lossy();
        if matches!(text.as_ref(), "-o" | "-P" | "-i") {
            iter.next();
        } else if !text.starts_with('-') {
            operands.push(text.into_owned());
        }
    }
    operands
}

fn success() -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn failure(stderr: String) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr,
    }
}

impl CommandRunner for LoopbackRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ShellError> {
        if program.ends_with("scp") {
            Ok(self.run_scp(args))
        } else {
            self.run_ssh(args)
        }
    }
}

/// Error type produced by [`FakeProvisioner`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct FakeProvisionerError {
    /// Human readable description.
    pub message: String,
    /// Whether the error belongs to the transient provider-API class.
    pub transient: bool,
}

impl FakeProvisionerError {
    /// A fatal provisioning-class error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// A transient provider-API-class error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

#[derive(Debug, Default)]
struct FakeProvisionerState {
    provision_error: Option<FakeProvisionerError>,
    poll_error: Option<FakeProvisionerError>,
    terminate_error: Option<FakeProvisionerError>,
    provision_calls: u32,
    poll_calls: u32,
    terminate_calls: u32,
    terminated_ids: Vec<String>,
}

/// Scripted provisioner double used to test lifecycle sequencing without a
/// provider.
#[derive(Clone, Debug, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<FakeProvisionerState>>,
}

impl FakeProvisioner {
    /// Creates a provisioner that succeeds at every step.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `provision` call fail.
    pub fn fail_provision(&self, error: FakeProvisionerError) {
        self.lock().provision_error = Some(error);
    }

    /// Makes the next `poll_until_running` call fail.
    pub fn fail_poll(&self, error: FakeProvisionerError) {
        self.lock().poll_error = Some(error);
    }

    /// Makes every `terminate` call fail with `error`.
    pub fn fail_terminate(&self, error: FakeProvisionerError) {
        self.lock().terminate_error = Some(error);
    }

    /// Number of `provision` calls observed.
    #[must_use]
    pub fn provision_calls(&self) -> u32 {
        self.lock().provision_calls
    }

    /// Number of `poll_until_running` calls observed.
    #[must_use]
    pub fn poll_calls(&self) -> u32 {
        self.lock().poll_calls
    }

    /// Number of `terminate` calls observed.
    #[must_use]
    pub fn terminate_calls(&self) -> u32 {
        self.lock().terminate_calls
    }

    /// Instance identifiers passed to `terminate`.
    #[must_use]
    pub fn terminated_ids(&self) -> Vec<String> {
        self.lock().terminated_ids.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeProvisionerState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Provisioner for FakeProvisioner {
    type Error = FakeProvisionerError;

    fn provision<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProvisionerFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            let mut state = self.lock();
            state.provision_calls += 1;
            if let Some(error) = state.provision_error.take() {
                return Err(error);
            }
            let ids = (0..request.count).map(|n| format!("fake-{n}")).collect();
            Ok(InstanceHandle {
                ids,
                zone: request.zone.clone(),
            })
        })
    }

    fn poll_until_running<'a>(
        &'a self,
        _handle: &'a InstanceHandle,
    ) -> ProvisionerFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move {
            let mut state = self.lock();
            state.poll_calls += 1;
            if let Some(error) = state.poll_error.take() {
                return Err(error);
            }
            Ok(InstanceNetworking {
                public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ssh_port: 22,
            })
        })
    }

    fn terminate(&self, handle: InstanceHandle) -> ProvisionerFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.lock();
            state.terminate_calls += 1;
            state.terminated_ids.extend(handle.ids);
            if let Some(error) = state.terminate_error.clone() {
                return Err(error);
            }
            Ok(())
        })
    }

    fn is_transient_teardown(error: &Self::Error) -> bool {
        error.transient
    }
}
