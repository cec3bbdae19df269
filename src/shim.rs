//! Build integration shim: the narrow surface a host build framework calls.
//!
//! The shim composes over the rest of the crate rather than inheriting the
//! framework's environment type. It exposes exactly two entry points: a
//! factory producing an opaque [`RemoteAction`] token, and
//! [`BuildContext::run_action`], which performs the full stage, execute,
//! fetch, scrub, and teardown sequence for one build action. Passing a token
//! built by one context to another is harmless; tokens carry no connection
//! state.

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::action::{ActionError, ActionExecutor, ActionInput, RemoteCommand};
use crate::config::{RuntimeConfig, ScalewayConfig};
use crate::lifecycle::LifecycleManager;
use crate::scaleway::{ScalewayProvisioner, ScalewayProvisionerError};
use crate::shell::{ConnectConfig, ProcessCommandRunner};

/// Errors surfaced through the build integration surface.
#[derive(Debug, Error)]
pub enum ShimError {
    /// Raised when configuration sources cannot be loaded or merged.
    #[error("failed to load configuration: {0}")]
    Config(String),
    /// Raised when remote execution is requested before the provider has
    /// been configured. Caller-programming-error class.
    #[error("outpost is not configured: {0}")]
    NotConfigured(String),
    /// Raised when the provisioner rejects its configuration or request.
    #[error(transparent)]
    Provisioner(#[from] ScalewayProvisionerError),
    /// Raised by any phase of the remote action.
    #[error(transparent)]
    Action(#[from] ActionError<ScalewayProvisionerError>),
    /// Raised when the force-local fallback cannot start the command.
    #[error("failed to start the local action: {0}")]
    LocalSpawn(#[source] std::io::Error),
    /// Raised when the force-local fallback exits non-zero.
    #[error("local action exited with status {code:?}")]
    LocalExecution {
        /// Exit code of the local process, when one was reported.
        code: Option<i32>,
    },
}

/// Settings gathered once before any action token can be built.
///
/// The force-local flag is read here and never re-read: a context built from
/// these settings keeps the same execution mode for its whole lifetime.
#[derive(Clone, Debug)]
pub struct ActionSettings {
    /// Provider configuration; absent in force-local mode, where no instance
    /// is ever provisioned.
    pub provider: Option<ScalewayConfig>,
    /// SSH connection configuration.
    pub connect: ConnectConfig,
    /// Whether every action runs locally, in place, without provisioning.
    pub force_local: bool,
}

impl ActionSettings {
    /// Loads settings from configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::Config`] when merging sources fails, and
    /// [`ShimError::NotConfigured`] when remote execution is requested but
    /// the provider configuration is missing.
    pub fn load() -> Result<Self, ShimError> {
        let runtime =
            RuntimeConfig::load_without_cli_args().map_err(|err| ShimError::Config(err.to_string()))?;
        let connect =
            ConnectConfig::load_without_cli_args().map_err(|err| ShimError::Config(err.to_string()))?;
        let provider = if runtime.force_local {
            None
        } else {
            let config = ScalewayConfig::load_without_cli_args()
                .map_err(|err| ShimError::NotConfigured(err.to_string()))?;
            Some(config)
        };
        Ok(Self {
            provider,
            connect,
            force_local: runtime.force_local,
        })
    }
}

/// Opaque token produced by [`BuildContext::action`] and consumed by
/// [`BuildContext::run_action`]. Carries the command only; targets and
/// sources arrive per invocation.
#[derive(Clone, Debug)]
pub struct RemoteAction {
    command: RemoteCommand,
}

/// The configured entry point handed to the host build framework.
#[derive(Clone, Debug)]
pub struct BuildContext {
    provider: Option<ScalewayConfig>,
    connect: ConnectConfig,
    force_local: bool,
    instance_type: Option<String>,
    image: Option<String>,
    echo: bool,
}

impl BuildContext {
    /// Validates the settings and builds a context.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::NotConfigured`] when the connection configuration
    /// is invalid, or when remote execution is requested without a provider
    /// configuration.
    pub fn new(settings: ActionSettings) -> Result<Self, ShimError> {
        settings
            .connect
            .validate()
            .map_err(|err| ShimError::NotConfigured(err.to_string()))?;
        if !settings.force_local {
            let provider = settings
                .provider
                .as_ref()
                .ok_or_else(|| ShimError::NotConfigured(String::from("no provider configuration")))?;
            provider
                .validate()
                .map_err(|err| ShimError::NotConfigured(err.to_string()))?;
        }
        Ok(Self {
            provider: settings.provider,
            connect: settings.connect,
            force_local: settings.force_local,
            instance_type: None,
            image: None,
            echo: false,
        })
    }

    /// Overrides the instance type for actions run through this context.
    #[must_use]
    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = Some(instance_type.into());
        self
    }

    /// Overrides the image label for actions run through this context.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Replays remote command output on the caller's console instead of
    /// suppressing it.
    #[must_use]
    pub const fn with_echoed_output(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Captures a command and its arguments as an opaque action token. Each
    /// argument is shell-escaped before being flattened.
    #[must_use]
    pub fn action(&self, program: impl Into<String>, args: &[String]) -> RemoteAction {
        let flattened = args
            .iter()
            .map(|arg| escape(arg.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        RemoteAction {
            command: RemoteCommand::new(program, flattened),
        }
    }

    /// Runs one build action: provisions an instance, stages the sources,
    /// executes the command, fetches the targets, and tears everything down.
    /// In force-local mode the command runs in place instead.
    ///
    /// # Errors
    ///
    /// Returns the [`ShimError`] naming the failing phase; teardown has
    /// already completed by the time an error is returned.
    pub async fn run_action(
        &self,
        action: &RemoteAction,
        targets: &[Utf8PathBuf],
        sources: &[ActionInput],
    ) -> Result<(), ShimError> {
        if self.force_local {
            return self.run_local(action, targets, sources);
        }

        let provider = self
            .provider
            .clone()
            .ok_or_else(|| ShimError::NotConfigured(String::from("no provider configuration")))?;
        let provisioner = ScalewayProvisioner::new(provider)?;
        let mut request = provisioner.default_request()?;
        if let Some(instance_type) = &self.instance_type {
            request.instance_type = instance_type.clone();
        }
        if let Some(image) = &self.image {
            request.image_label = image.clone();
        }

        let mut manager =
            LifecycleManager::new(provisioner, self.connect.clone(), ProcessCommandRunner)
                .map_err(ActionError::from)?;
        manager.open(&request).await.map_err(ActionError::from)?;

        let mut executor = ActionExecutor::new(&mut manager);
        if self.echo {
            executor = executor.with_echoed_output();
        }
        executor.execute(&action.command, targets, sources).await?;
        Ok(())
    }

    /// Runs the action in place with local paths, bypassing provisioning.
    fn run_local(
        &self,
        action: &RemoteAction,
        targets: &[Utf8PathBuf],
        sources: &[ActionInput],
    ) -> Result<(), ShimError> {
        let mut parts = vec![action.command.program.clone()];
        if !action.command.args.trim().is_empty() {
            parts.push(action.command.args.clone());
        }
        parts.extend(sources.iter().map(|source| match source {
            ActionInput::File(path) => path.to_string(),
            ActionInput::Value(value) => value.clone(),
        }));
        parts.extend(targets.iter().map(Utf8PathBuf::to_string));

        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(parts.join(" "))
            .status()
            .map_err(ShimError::LocalSpawn)?;
        if status.success() {
            Ok(())
        } else {
            Err(ShimError::LocalExecution {
                code: status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::DEFAULT_REMOTE_ROOT;

    fn connect_config() -> ConnectConfig {
        ConnectConfig {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            ssh_user: String::from("root"),
            ssh_identity_file: None,
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 10,
            max_attempts: 6,
            remote_root: String::from(DEFAULT_REMOTE_ROOT),
        }
    }

    fn local_settings() -> ActionSettings {
        ActionSettings {
            provider: None,
            connect: connect_config(),
            force_local: true,
        }
    }

    #[test]
    fn action_tokens_escape_their_arguments() {
        let context = BuildContext::new(local_settings()).expect("context should build");
        let action = context.action("echo", &[String::from("a b"), String::from("c'd")]);
        assert_eq!(action.command.program, "echo");
        assert_eq!(action.command.args, "'a b' 'c'\\''d'");
    }

    #[test]
    fn remote_mode_requires_a_provider_configuration() {
        let settings = ActionSettings {
            provider: None,
            connect: connect_config(),
            force_local: false,
        };
        let err = BuildContext::new(settings).expect_err("missing provider should be rejected");
        assert!(matches!(err, ShimError::NotConfigured(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn force_local_runs_the_command_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
        let source = root.join("in.txt");
        let target = root.join("out.txt");
        std::fs::write(&source, b"payload").expect("write source");

        let context = BuildContext::new(local_settings()).expect("context should build");
        let action = context.action("cp", &[]);
        context
            .run_action(
                &action,
                &[target.clone()],
                &[ActionInput::File(source.clone())],
            )
            .await
            .expect("local copy should succeed");

        let copied = std::fs::read(&target).expect("target should exist");
        assert_eq!(copied, b"payload");
    }

    #[tokio::test]
    async fn force_local_surfaces_nonzero_exits() {
        let context = BuildContext::new(local_settings()).expect("context should build");
        let action = context.action("false", &[]);
        let err = context
            .run_action(&action, &[], &[])
            .await
            .expect_err("false exits non-zero");
        assert!(
            matches!(err, ShimError::LocalExecution { code: Some(1) }),
            "unexpected error: {err}"
        );
    }
}
