//! Core library for the outpost remote build-action tool.
//!
//! The crate offloads one build action at a time to an ephemeral cloud
//! instance: it provisions a Scaleway VM, opens an SSH session, stages the
//! action's source files into a remote workspace, runs the command, fetches
//! the produced targets back, scrubs the workspace, and tears the instance
//! down with guaranteed cleanup on every exit path.

pub mod action;
pub mod backend;
pub mod config;
pub mod lifecycle;
pub mod scaleway;
pub mod shell;
pub mod shim;
pub mod test_support;

pub use action::{ActionError, ActionExecutor, ActionInput, RemoteCommand};
pub use backend::{
    BackendError, InstanceHandle, InstanceNetworking, InstanceRequest, InstanceRequestBuilder,
    Provisioner,
};
pub use config::{ConfigError, RuntimeConfig, ScalewayConfig};
pub use lifecycle::{LifecycleError, LifecycleManager, LifecycleState};
pub use scaleway::{ScalewayProvisioner, ScalewayProvisionerError};
pub use shell::{
    CommandOutput, CommandRunner, ConnectConfig, ConnectConfigLoadError, DEFAULT_REMOTE_ROOT,
    ProcessCommandRunner, ShellError, ShellSession, TransferDirection,
};
pub use shim::{ActionSettings, BuildContext, RemoteAction, ShimError};
