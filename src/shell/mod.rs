//! Shell transport over the system `ssh` and `scp` clients.
//!
//! A [`ShellSession`] owns one multiplexed SSH connection to one host,
//! established as an OpenSSH control master. Commands and file transfers are
//! issued through the shared control socket so they reuse the single
//! authenticated session. A session has exactly two observable states, open
//! and closed; once closed it cannot be reopened.

use std::ffi::OsString;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use uuid::Uuid;

use crate::backend::InstanceNetworking;

mod config;
mod error;
mod runner;
mod util;

pub use config::{ConnectConfig, ConnectConfigLoadError, DEFAULT_REMOTE_ROOT};
pub use error::{ShellError, TransferDirection};
pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use util::expand_tilde;

/// A live shell connection bound to exactly one remote address.
#[derive(Clone, Debug)]
pub struct ShellSession<R: CommandRunner> {
    config: ConnectConfig,
    address: InstanceNetworking,
    control_path: Utf8PathBuf,
    runner: R,
    open: bool,
}

impl<R: CommandRunner> ShellSession<R> {
    /// Opens a session to `address` by starting an SSH control master.
    ///
    /// Performs a single connection attempt; retry policy belongs to the
    /// lifecycle manager.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::ConnectFailed`] when the SSH client exits
    /// non-zero (the retryable connection-refused/timeout class), or
    /// [`ShellError::Spawn`] when the client cannot be started at all.
    pub fn open(
        address: InstanceNetworking,
        config: ConnectConfig,
        runner: R,
    ) -> Result<Self, ShellError> {
        config.validate()?;
        let control_path = control_socket_path()?;

        let session = Self {
            config,
            address,
            control_path,
            runner,
            open: false,
        };

        let mut args = vec![
            OsString::from("-M"),
            OsString::from("-S"),
            OsString::from(session.control_path.as_str()),
            OsString::from("-f"),
            OsString::from("-N"),
        ];
        args.extend(session.common_ssh_options());
        args.push(session.destination());

        let output = session.runner.run(&session.config.ssh_bin, &args)?;
        if !output.is_success() {
            return Err(ShellError::ConnectFailed {
                status: output.code,
                stderr: output.stderr,
            });
        }

        Ok(Self {
            open: true,
            ..session
        })
    }

    /// Reports whether the session is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Executes `command` synchronously on the remote host.
    ///
    /// Output is captured; when `echo` is set it is also replayed onto the
    /// caller's stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::SessionClosed`] when the session is closed and
    /// [`ShellError::RemoteExecution`] with the exit status and captured
    /// output when the remote process exits non-zero.
    pub fn run(&self, command: &str, echo: bool) -> Result<CommandOutput, ShellError> {
        if !self.open {
            return Err(ShellError::SessionClosed);
        }

        let mut args = vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
        ];
        args.extend(self.common_ssh_options());
        args.push(self.destination());
        args.push(OsString::from(command));

        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        if echo {
            std::io::stdout().write_all(output.stdout.as_bytes()).ok();
            std::io::stderr().write_all(output.stderr.as_bytes()).ok();
        }

        if !output.is_success() {
            return Err(ShellError::RemoteExecution {
                command: command.to_owned(),
                status: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Creates `path` (and missing intermediates) on the remote host.
    ///
    /// # Errors
    ///
    /// Propagates [`ShellError`] from the underlying [`ShellSession::run`].
    pub fn make_dir(&self, path: &str) -> Result<(), ShellError> {
        let command = format!("mkdir -p {}", escape(path.into()));
        self.run(&command, false).map(|_| ())
    }

    /// Copies one local file to the remote host. Parent directories are not
    /// created; callers must pre-create them.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Transfer`] when the copy exits non-zero.
    pub fn upload(&self, local: &Utf8Path, remote: &str) -> Result<(), ShellError> {
        if !self.open {
            return Err(ShellError::SessionClosed);
        }
        let mut args = self.common_scp_options();
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(format!(
            "{}@{}:{remote}",
            self.config.ssh_user, self.address.public_ip
        )));
        self.transfer(args, TransferDirection::Upload, local.as_str())
    }

    /// Copies one remote file back to the local host. Inverse of
    /// [`ShellSession::upload`].
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Transfer`] when the copy exits non-zero.
    pub fn download(&self, remote: &str, local: &Utf8Path) -> Result<(), ShellError> {
        if !self.open {
            return Err(ShellError::SessionClosed);
        }
        let mut args = self.common_scp_options();
        args.push(OsString::from(format!(
            "{}@{}:{remote}",
            self.config.ssh_user, self.address.public_ip
        )));
        args.push(OsString::from(local.as_str()));
        self.transfer(args, TransferDirection::Download, remote)
    }

    /// Terminates the session. Idempotent; after return the session reports
    /// closed unless the exit command itself could not be spawned.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Spawn`] when the SSH client cannot be started to
    /// deliver the exit request; the session then still reports open.
    pub fn close(&mut self) -> Result<(), ShellError> {
        if !self.open {
            return Ok(());
        }

        let args = vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-O"),
            OsString::from("exit"),
            self.destination(),
        ];

        // A non-zero exit from `-O exit` means the master is already gone,
        // which still leaves the session closed.
        self.runner.run(&self.config.ssh_bin, &args)?;
        self.open = false;
        Ok(())
    }

    fn transfer(
        &self,
        args: Vec<OsString>,
        direction: TransferDirection,
        path: &str,
    ) -> Result<(), ShellError> {
        let output = self.runner.run(&self.config.scp_bin, &args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(ShellError::Transfer {
            direction,
            path: path.to_owned(),
            status: output.code,
            stderr: output.stderr,
        })
    }

    fn common_ssh_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.address.ssh_port.to_string()),
        ];
        args.extend(self.shared_client_options());
        args
    }

    fn common_scp_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", self.control_path)),
            OsString::from("-P"),
            OsString::from(self.address.ssh_port.to_string()),
        ];
        args.extend(self.shared_client_options());
        args
    }

    fn shared_client_options(&self) -> Vec<OsString> {
        let mut args = Vec::new();

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            let expanded = expand_tilde(identity_file);
            args.push(OsString::from("-i"));
            args.push(OsString::from(expanded));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));

        args
    }

    fn destination(&self) -> OsString {
        OsString::from(format!(
            "{}@{}",
            self.config.ssh_user, self.address.public_ip
        ))
    }
}

fn control_socket_path() -> Result<Utf8PathBuf, ShellError> {
    let path = std::env::temp_dir().join(format!("outpost-{}.sock", Uuid::new_v4().simple()));
    Utf8PathBuf::from_path_buf(path).map_err(|path| ShellError::ControlPath {
        path: path.display().to_string(),
    })
}
