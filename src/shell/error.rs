//! Error types for the shell transport.

use thiserror::Error;

/// Direction of a file transfer between the local and remote hosts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferDirection {
    /// Local file copied to the remote workspace.
    Upload,
    /// Remote file copied back to the local workspace.
    Download,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Errors surfaced by shell sessions and command runners.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ShellError {
    /// Raised when connection configuration is missing required values.
    #[error("missing {field}: set OUTPOST_SSH_{env_suffix} or add {field} to [ssh] in outpost.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the SSH control master fails to establish a session.
    /// This covers the connection-refused and timeout class of failures and
    /// is the only retryable error.
    #[error("shell connection failed with status {status:?}: {stderr}")]
    ConnectFailed {
        /// Exit status reported by the SSH client, if available.
        status: Option<i32>,
        /// Stderr captured from the SSH client.
        stderr: String,
    },
    /// Raised when a remote command exits non-zero.
    #[error("remote command `{command}` exited with status {status:?}: {stderr}")]
    RemoteExecution {
        /// Command line executed on the remote host.
        command: String,
        /// Remote exit status, if available.
        status: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a file transfer exits non-zero.
    #[error("{direction} of {path} failed with status {status:?}: {stderr}")]
    Transfer {
        /// Transfer direction.
        direction: TransferDirection,
        /// Path that was being transferred.
        path: String,
        /// Exit status reported by the transfer tool, if available.
        status: Option<i32>,
        /// Stderr captured from the transfer tool.
        stderr: String,
    },
    /// Raised when an operation is attempted on a closed session.
    #[error("shell session is closed")]
    SessionClosed,
    /// Raised when the control socket path is not valid UTF-8.
    #[error("control socket path is not valid UTF-8: {path}")]
    ControlPath {
        /// Lossy rendering of the offending path.
        path: String,
    },
}

impl ShellError {
    /// Returns `true` for failures worth another connection attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. })
    }
}
