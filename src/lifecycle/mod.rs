//! Connection lifecycle state machine for one remote node.
//!
//! The manager composes a [`Provisioner`] and a [`ShellSession`] and drives
//! the path from unprovisioned to connected, and from connected back to idle
//! with guaranteed cleanup. It is the sole owner of the instance handle and
//! the shell session; executors borrow the session for the duration of one
//! action and never outlive it. At most one action may be in flight per
//! manager.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::backend::{InstanceHandle, InstanceRequest, Provisioner};
use crate::shell::{CommandRunner, ConnectConfig, ShellError, ShellSession};

/// Interval slept between connection attempts.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Observable states of the connection lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
    /// No instance and no connection exist.
    Idle,
    /// A launch request has been submitted.
    Provisioning,
    /// Waiting for every launched instance to report running.
    WaitingReady,
    /// Attempting to open the shell session, bounded by the attempt budget.
    Connecting,
    /// A shell session is open and usable.
    Connected,
    /// Teardown is in progress.
    TearingDown,
}

/// Errors surfaced while opening or closing a lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError<PE>
where
    PE: std::error::Error + 'static,
{
    /// Raised when the launch request is rejected. Fatal: repeating an
    /// identical request will not succeed.
    #[error("failed to provision instance: {0}")]
    Provision(#[source] PE),
    /// Raised when the instances never report running.
    #[error("instance did not become ready: {0}")]
    Readiness(#[source] PE),
    /// Raised when a connection attempt fails in a way retrying cannot fix.
    #[error("failed to connect: {0}")]
    Connect(#[source] ShellError),
    /// Raised when the connection attempt budget is exhausted.
    #[error("shell connection did not open in {attempts} attempts")]
    ConnectionTimeout {
        /// Number of attempts made.
        attempts: u32,
    },
    /// Raised when `open` is called while a session is already open.
    #[error("a shell connection is already open")]
    AlreadyOpen,
    /// Raised when the session still reports open after teardown. This is a
    /// transport invariant violation and the only teardown failure that
    /// propagates.
    #[error("shell connection failed to close")]
    ConnectionStillOpen,
    /// Raised when the connection configuration fails validation.
    #[error("invalid connection configuration: {0}")]
    Config(#[source] ShellError),
}

/// Drives the provision → connect → teardown state machine.
#[derive(Debug)]
pub struct LifecycleManager<P, R>
where
    P: Provisioner,
    R: CommandRunner + Clone,
{
    provisioner: P,
    config: ConnectConfig,
    runner: R,
    state: LifecycleState,
    handle: Option<InstanceHandle>,
    session: Option<ShellSession<R>>,
    retry_interval: Duration,
}

impl<P, R> LifecycleManager<P, R>
where
    P: Provisioner,
    R: CommandRunner + Clone,
{
    /// Creates a manager in the `Idle` state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] when the connection configuration
    /// fails validation.
    pub fn new(
        provisioner: P,
        config: ConnectConfig,
        runner: R,
    ) -> Result<Self, LifecycleError<P::Error>> {
        config.validate().map_err(LifecycleError::Config)?;
        Ok(Self {
            provisioner,
            config,
            runner,
            state: LifecycleState::Idle,
            handle: None,
            session: None,
            retry_interval: CONNECT_RETRY_INTERVAL,
        })
    }

    /// Overrides the connection retry interval.
    ///
    /// This is primarily used by tests to keep retry scenarios fast.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns the connection configuration.
    #[must_use]
    pub const fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Returns the open shell session, if connected.
    #[must_use]
    pub const fn session(&self) -> Option<&ShellSession<R>> {
        self.session.as_ref()
    }

    /// Reports whether a shell session is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(ShellSession::is_open)
    }

    /// Provisions the requested instances, waits for readiness, and opens a
    /// shell session with a bounded retry budget.
    ///
    /// On any failure after provisioning succeeded, the instances are
    /// terminated best-effort before the error is returned, so the manager
    /// either ends `Connected` or ends `Idle` with nothing left running.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provision`] when the launch is rejected (no
    /// retry), [`LifecycleError::Readiness`] when instances never report
    /// running, [`LifecycleError::Connect`] for non-retryable connection
    /// failures, and [`LifecycleError::ConnectionTimeout`] when the attempt
    /// budget is exhausted.
    pub async fn open(&mut self, request: &InstanceRequest) -> Result<(), LifecycleError<P::Error>> {
        if self.session.is_some() {
            return Err(LifecycleError::AlreadyOpen);
        }

        self.state = LifecycleState::Provisioning;
        let handle = match self.provisioner.provision(request).await {
            Ok(handle) => handle,
            Err(err) => {
                self.state = LifecycleState::Idle;
                return Err(LifecycleError::Provision(err));
            }
        };
        self.handle = Some(handle.clone());

        self.state = LifecycleState::WaitingReady;
        let networking = match self.provisioner.poll_until_running(&handle).await {
            Ok(networking) => networking,
            Err(err) => {
                self.release_instances().await;
                self.state = LifecycleState::Idle;
                return Err(LifecycleError::Readiness(err));
            }
        };

        // The provider reporting "running" does not mean the SSH daemon is
        // accepting connections yet, hence the bounded retry loop.
        self.state = LifecycleState::Connecting;
        for attempt in 1..=self.config.max_attempts {
            match ShellSession::open(networking.clone(), self.config.clone(), self.runner.clone())
            {
                Ok(session) => {
                    self.session = Some(session);
                    self.state = LifecycleState::Connected;
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(attempt, error = %err, "connection attempt failed");
                    if attempt < self.config.max_attempts {
                        sleep(self.retry_interval).await;
                    }
                }
                Err(err) => {
                    self.release_instances().await;
                    self.state = LifecycleState::Idle;
                    return Err(LifecycleError::Connect(err));
                }
            }
        }

        self.release_instances().await;
        self.state = LifecycleState::Idle;
        Err(LifecycleError::ConnectionTimeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Tears down the instance and the shell session.
    ///
    /// Always attempts, in order: instance termination, the delayed
    /// self-shutdown fallback when termination hits a transient provider
    /// error, and session close. Idempotent; cleanup failures are logged and
    /// swallowed so they never mask an in-flight action failure.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ConnectionStillOpen`] when the session still
    /// reports open after teardown, the one consistency violation worth
    /// surfacing loudly.
    pub async fn close(&mut self) -> Result<(), LifecycleError<P::Error>> {
        self.state = LifecycleState::TearingDown;

        if let Some(handle) = self.handle.take()
            && let Err(err) = self.provisioner.terminate(handle).await
        {
            if P::is_transient_teardown(&err) {
                tracing::warn!(
                    error = %err,
                    "terminate hit a transient provider error, issuing delayed self-shutdown"
                );
                self.self_shutdown_fallback();
            } else {
                tracing::warn!(error = %err, "failed to terminate instances during teardown");
            }
        }

        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.close() {
                tracing::warn!(error = %err, "failed to close shell session");
            }
            if session.is_open() {
                self.state = LifecycleState::Idle;
                return Err(LifecycleError::ConnectionStillOpen);
            }
        }

        self.state = LifecycleState::Idle;
        Ok(())
    }

    /// Issues a delayed self-shutdown over the still-open session so the
    /// instance reaps itself when the provider API would not.
    fn self_shutdown_fallback(&self) {
        match self.session.as_ref() {
            Some(session) => {
                if let Err(err) = session.run("sudo shutdown -h +1", false) {
                    tracing::warn!(error = %err, "delayed self-shutdown fallback failed");
                }
            }
            None => {
                tracing::warn!("no open session available for the self-shutdown fallback");
            }
        }
    }

    async fn release_instances(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(err) = self.provisioner.terminate(handle).await
        {
            tracing::warn!(error = %err, "failed to terminate instances after an aborted open");
        }
    }
}

#[cfg(test)]
mod tests;
