//! Connection configuration structures and validation.
//!
//! [`ConnectConfig`] holds the host-independent SSH parameters. The address
//! of the provisioned instance is merged in at connect time and is never
//! stored here. Configuration is loaded via `ortho-config`, which merges
//! defaults, configuration files, and environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use super::error::ShellError;

/// Default remote workspace root created for each action's staged files.
pub const DEFAULT_REMOTE_ROOT: &str = "scons-compute";

/// SSH connection settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "OUTPOST_SSH_")]
pub struct ConnectConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable used for file staging.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Path to the SSH private key file for remote authentication. Supports
    /// tilde expansion (`~/.ssh/id_ed25519`). Optional; when not provided,
    /// SSH falls back to default key locations. Validation rejects empty or
    /// whitespace-only values.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true, skip_cli)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; defaults to disabling to smooth
    /// ephemeral hosts.
    #[ortho_config(default = false, skip_cli)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Per-attempt TCP connect timeout, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Maximum number of connection attempts before giving up.
    #[ortho_config(default = 6)]
    pub max_attempts: u32,
    /// Remote workspace root directory staged files live under.
    #[ortho_config(default = DEFAULT_REMOTE_ROOT.to_owned())]
    pub remote_root: String,
}

/// Errors raised when loading the connection configuration from layered
/// sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConnectConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("connection configuration parsing failed: {0}")]
    Parse(String),
}

impl ConnectConfig {
    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidConfig`] when any required field is empty
    /// or the attempt budget is zero.
    pub fn validate(&self) -> Result<(), ShellError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_value(&self.remote_root, "remote_root")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        if self.max_attempts == 0 {
            return Err(ShellError::InvalidConfig {
                field: "max_attempts".to_owned(),
            });
        }
        Ok(())
    }

    /// Loads configuration from defaults, configuration files, and
    /// environment variables, ignoring CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConnectConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("outpost")])
            .map_err(|err| ConnectConfigLoadError::Parse(err.to_string()))
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), ShellError> {
        match value {
            None => Ok(()), // Not configured; SSH uses defaults
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(ShellError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), ShellError> {
        Self::require_optional_value(Some(value), field)
    }
}
