//! Remote action protocol: stage inputs, run the command, fetch outputs,
//! scrub the workspace.
//!
//! An executor is invoked once per build action against a connected
//! [`LifecycleManager`]. It borrows the shell session for the duration of the
//! action and guarantees that the manager's `close` runs exactly once on
//! every exit path, success or failure. Executors must not be reentered
//! concurrently for the same manager.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;

use crate::backend::Provisioner;
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::shell::{CommandRunner, ShellError};

/// The executable and flattened argument string run on the remote host.
/// Built fresh per action invocation and never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    /// Executable name invoked on the remote host.
    pub program: String,
    /// Flat argument string appended before the staged paths.
    pub args: String,
}

impl RemoteCommand {
    /// Creates a command from an executable name and a flat argument string.
    #[must_use]
    pub fn new(program: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: args.into(),
        }
    }
}

/// A declared source for one action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActionInput {
    /// A real file staged into the remote workspace before execution.
    File(Utf8PathBuf),
    /// A computed value passed through to the remote command line literally,
    /// never uploaded.
    Value(String),
}

/// Errors surfaced while executing a remote action. Each variant names the
/// failing phase.
#[derive(Debug, Error)]
pub enum ActionError<PE>
where
    PE: std::error::Error + 'static,
{
    /// Raised when opening or driving the lifecycle fails.
    #[error("remote connection failed: {0}")]
    Lifecycle(#[from] LifecycleError<PE>),
    /// Raised when the manager holds no open session.
    #[error("no open shell connection for the remote action")]
    NotConnected,
    /// Raised when a remote workspace directory cannot be created.
    #[error("failed to create remote directory {path}: {source}")]
    Workspace {
        /// Remote directory being created.
        path: String,
        /// Underlying shell failure.
        #[source]
        source: ShellError,
    },
    /// Raised when staging a source file fails.
    #[error("failed to stage {path}: {source}")]
    Stage {
        /// Local file being staged.
        path: Utf8PathBuf,
        /// Underlying shell failure.
        #[source]
        source: ShellError,
    },
    /// Raised when the remote command exits non-zero; carries the exit
    /// status and captured output.
    #[error("remote execution failed: {0}")]
    Execute(#[source] ShellError),
    /// Raised when fetching a produced target fails.
    #[error("failed to fetch {path}: {source}")]
    Fetch {
        /// Remote path being fetched.
        path: String,
        /// Underlying shell failure.
        #[source]
        source: ShellError,
    },
    /// Raised when the remote workspace cannot be removed.
    #[error("failed to scrub remote workspace: {0}")]
    Scrub(#[source] ShellError),
    /// Raised when teardown fails after the action itself succeeded.
    #[error("teardown failed after a successful action: {0}")]
    Teardown(#[source] LifecycleError<PE>),
}

/// Maps a local path into the remote workspace under `root`.
///
/// Backslashes are normalised to forward slashes first, so Windows-style
/// paths map onto the same remote layout.
#[must_use]
pub fn remote_path(root: &str, local: &Utf8Path) -> String {
    format!("{root}/{}", local.as_str().replace('\\', "/"))
}

/// Returns the remote command-line representation of one source: files are
/// remapped under `root`, computed values keep their literal representation.
#[must_use]
pub fn remote_source_repr(root: &str, source: &ActionInput) -> String {
    match source {
        ActionInput::File(path) => remote_path(root, path),
        ActionInput::Value(value) => value.clone(),
    }
}

/// Computes the distinct parent directories implied by the given remote
/// paths, excluding the workspace root itself and the empty string. The
/// result is ordered, so directory creation is deterministic.
#[must_use]
pub fn remote_parent_dirs<'a>(
    root: &str,
    paths: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<String> {
    paths
        .into_iter()
        .filter_map(|path| path.rsplit_once('/').map(|(dir, _)| dir))
        .filter(|dir| !dir.is_empty() && *dir != root)
        .map(str::to_owned)
        .collect()
}

fn render_command_line(
    command: &RemoteCommand,
    remote_sources: &[String],
    remote_targets: &[String],
) -> String {
    let mut parts = vec![command.program.clone()];
    if !command.args.trim().is_empty() {
        parts.push(command.args.clone());
    }
    parts.extend(remote_sources.iter().cloned());
    parts.extend(remote_targets.iter().cloned());
    parts.join(" ")
}

/// Runs one remote action over a connected [`LifecycleManager`].
#[derive(Debug)]
pub struct ActionExecutor<'m, P, R>
where
    P: Provisioner,
    R: CommandRunner + Clone,
{
    manager: &'m mut LifecycleManager<P, R>,
    echo: bool,
}

impl<'m, P, R> ActionExecutor<'m, P, R>
where
    P: Provisioner,
    R: CommandRunner + Clone,
{
    /// Creates an executor borrowing the manager for one action.
    #[must_use]
    pub fn new(manager: &'m mut LifecycleManager<P, R>) -> Self {
        Self {
            manager,
            echo: false,
        }
    }

    /// Replays the remote command's output onto the caller's console instead
    /// of suppressing it.
    #[must_use]
    pub const fn with_echoed_output(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Stages sources, runs the command, fetches targets, scrubs the remote
    /// workspace, and tears the lifecycle down.
    ///
    /// Steps are not individually retried: the first failure aborts the
    /// remaining steps, but teardown always still runs, exactly once.
    ///
    /// # Errors
    ///
    /// Returns the [`ActionError`] variant naming the phase that failed. When
    /// the action succeeded but teardown left the connection open,
    /// [`ActionError::Teardown`] is returned.
    pub async fn execute(
        self,
        command: &RemoteCommand,
        targets: &[Utf8PathBuf],
        sources: &[ActionInput],
    ) -> Result<(), ActionError<P::Error>> {
        let result = self.stage_execute_fetch(command, targets, sources);
        let close_result = self.manager.close().await;
        match (result, close_result) {
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(teardown)) => {
                // The in-flight failure wins; the consistency violation is
                // still worth shouting about.
                tracing::error!(error = %teardown, "teardown failed while handling an action failure");
                Err(err)
            }
            (Ok(()), Err(teardown)) => Err(ActionError::Teardown(teardown)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn stage_execute_fetch(
        &self,
        command: &RemoteCommand,
        targets: &[Utf8PathBuf],
        sources: &[ActionInput],
    ) -> Result<(), ActionError<P::Error>> {
        let root = self.manager.config().remote_root.clone();
        let session = self.manager.session().ok_or(ActionError::NotConnected)?;

        let remote_targets: Vec<String> = targets
            .iter()
            .map(|target| remote_path(&root, target))
            .collect();
        let remote_sources: Vec<String> = sources
            .iter()
            .map(|source| remote_source_repr(&root, source))
            .collect();
        let uploads: Vec<(&Utf8PathBuf, String)> = sources
            .iter()
            .filter_map(|source| match source {
                ActionInput::File(path) => Some((path, remote_path(&root, path))),
                ActionInput::Value(_) => None,
            })
            .collect();

        session.make_dir(&root).map_err(|err| ActionError::Workspace {
            path: root.clone(),
            source: err,
        })?;

        // Every directory an upload or fetch depends on is created up front;
        // remote directory creation is not concurrency-safe for repeated
        // identical paths, so this stays sequential.
        let staged_paths = remote_targets
            .iter()
            .map(String::as_str)
            .chain(uploads.iter().map(|(_, remote)| remote.as_str()));
        for dir in remote_parent_dirs(&root, staged_paths) {
            session.make_dir(&dir).map_err(|err| ActionError::Workspace {
                path: dir.clone(),
                source: err,
            })?;
        }

        for (local, remote) in &uploads {
            session
                .upload(local, remote)
                .map_err(|err| ActionError::Stage {
                    path: (*local).clone(),
                    source: err,
                })?;
        }

        let command_line = render_command_line(command, &remote_sources, &remote_targets);
        session
            .run(&command_line, self.echo)
            .map_err(ActionError::Execute)?;

        for (remote, local) in remote_targets.iter().zip(targets) {
            session
                .download(remote, local)
                .map_err(|err| ActionError::Fetch {
                    path: remote.clone(),
                    source: err,
                })?;
        }

        let scrub = format!("rm -r {}", escape(root.as_str().into()));
        session.run(&scrub, false).map_err(ActionError::Scrub)?;
        Ok(())
    }
}
