//! Tests for the lifecycle state machine, retry budget, and teardown paths.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::backend::InstanceRequest;
use crate::shell::DEFAULT_REMOTE_ROOT;
use crate::test_support::{FakeProvisioner, FakeProvisionerError, ScriptedRunner};

#[fixture]
fn config() -> ConnectConfig {
    ConnectConfig {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        ssh_user: String::from("ubuntu"),
        ssh_identity_file: None,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 10,
        max_attempts: 3,
        remote_root: String::from(DEFAULT_REMOTE_ROOT),
    }
}

#[fixture]
fn request() -> InstanceRequest {
    InstanceRequest::builder()
        .image_label("img")
        .instance_type("DEV1-S")
        .zone("fr-par-1")
        .project_id("proj")
        .architecture("x86_64")
        .build()
        .expect("request should validate")
}

#[fixture]
fn paired_request() -> InstanceRequest {
    InstanceRequest::builder()
        .image_label("img")
        .instance_type("DEV1-S")
        .zone("fr-par-1")
        .project_id("proj")
        .architecture("x86_64")
        .count(2)
        .build()
        .expect("request should validate")
}

fn manager(
    provisioner: &FakeProvisioner,
    runner: &ScriptedRunner,
    config: ConnectConfig,
) -> LifecycleManager<FakeProvisioner, ScriptedRunner> {
    LifecycleManager::new(provisioner.clone(), config, runner.clone())
        .expect("configuration should validate")
        .with_retry_interval(Duration::ZERO)
}

fn master_attempts(runner: &ScriptedRunner) -> usize {
    runner
        .invocations()
        .iter()
        .filter(|invocation| invocation.command_string().contains("-M"))
        .count()
}

#[rstest]
#[tokio::test]
async fn open_ends_connected_with_an_open_session(config: ConnectConfig, request: InstanceRequest) {
    let provisioner = FakeProvisioner::new();
    let runner = ScriptedRunner::new();
    runner.push_success();
    let mut manager = manager(&provisioner, &runner, config);

    manager.open(&request).await.expect("open should succeed");

    assert_eq!(manager.state(), LifecycleState::Connected);
    assert!(manager.is_connected());
    assert_eq!(provisioner.provision_calls(), 1);
    assert_eq!(provisioner.poll_calls(), 1);
    assert_eq!(provisioner.terminate_calls(), 0);
}

#[rstest]
#[tokio::test]
async fn open_makes_exactly_the_budgeted_attempts_then_terminates(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    let runner = ScriptedRunner::new();
    for _ in 0..3 {
        runner.push_failure(255);
    }
    let mut manager = manager(&provisioner, &runner, config);

    let err = manager
        .open(&request)
        .await
        .expect_err("exhausted budget should fail");

    assert!(
        matches!(err, LifecycleError::ConnectionTimeout { attempts: 3 }),
        "unexpected error: {err}"
    );
    assert_eq!(master_attempts(&runner), 3, "exactly three attempts");
    assert_eq!(provisioner.terminate_calls(), 1);
    assert_eq!(manager.state(), LifecycleState::Idle);
}

#[rstest]
#[tokio::test]
async fn open_recovers_when_a_later_attempt_succeeds(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    let runner = ScriptedRunner::new();
    runner.push_failure(255);
    runner.push_failure(255);
    runner.push_success();
    let mut manager = manager(&provisioner, &runner, config);

    manager
        .open(&request)
        .await
        .expect("third attempt should connect");

    assert_eq!(master_attempts(&runner), 3);
    assert_eq!(manager.state(), LifecycleState::Connected);
    assert_eq!(provisioner.terminate_calls(), 0);
}

#[rstest]
#[tokio::test]
async fn provision_rejection_is_fatal_and_leaves_nothing_behind(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    provisioner.fail_provision(FakeProvisionerError::fatal("quota exceeded"));
    let runner = ScriptedRunner::new();
    let mut manager = manager(&provisioner, &runner, config);

    let err = manager
        .open(&request)
        .await
        .expect_err("rejected launch should fail");

    assert!(matches!(err, LifecycleError::Provision(_)));
    assert_eq!(provisioner.poll_calls(), 0, "no readiness poll after rejection");
    assert_eq!(provisioner.terminate_calls(), 0, "nothing was provisioned");
    assert_eq!(manager.state(), LifecycleState::Idle);
}

#[rstest]
#[tokio::test]
async fn readiness_failure_terminates_the_provisioned_instances(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    provisioner.fail_poll(FakeProvisionerError::fatal("stuck in starting"));
    let runner = ScriptedRunner::new();
    let mut manager = manager(&provisioner, &runner, config);

    let err = manager
        .open(&request)
        .await
        .expect_err("readiness failure should surface");

    assert!(matches!(err, LifecycleError::Readiness(_)));
    assert_eq!(provisioner.terminate_calls(), 1);
    assert_eq!(master_attempts(&runner), 0, "no connection attempt was made");
}

#[rstest]
#[tokio::test]
async fn readiness_failure_terminates_every_launched_instance(
    config: ConnectConfig,
    paired_request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    provisioner.fail_poll(FakeProvisionerError::fatal("stuck in starting"));
    let runner = ScriptedRunner::new();
    let mut manager = manager(&provisioner, &runner, config);

    let err = manager
        .open(&paired_request)
        .await
        .expect_err("readiness failure should surface");

    assert!(matches!(err, LifecycleError::Readiness(_)));
    assert_eq!(
        provisioner.terminated_ids(),
        ["fake-0", "fake-1"],
        "both launched instances must be released"
    );
    assert_eq!(manager.state(), LifecycleState::Idle);
}

#[rstest]
#[tokio::test]
async fn non_retryable_connect_failure_aborts_without_retries(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    // No scripted responses: the first attempt reports a spawn failure.
    let runner = ScriptedRunner::new();
    let mut manager = manager(&provisioner, &runner, config);

    let err = manager
        .open(&request)
        .await
        .expect_err("spawn failure should abort");

    assert!(matches!(err, LifecycleError::Connect(_)));
    assert_eq!(master_attempts(&runner), 1);
    assert_eq!(provisioner.terminate_calls(), 1);
}

#[rstest]
#[tokio::test]
async fn close_is_idempotent(config: ConnectConfig, request: InstanceRequest) {
    let provisioner = FakeProvisioner::new();
    let runner = ScriptedRunner::new();
    runner.push_success(); // master
    runner.push_success(); // -O exit
    let mut manager = manager(&provisioner, &runner, config);
    manager.open(&request).await.expect("open should succeed");

    manager.close().await.expect("first close should succeed");
    assert_eq!(manager.state(), LifecycleState::Idle);
    manager.close().await.expect("second close is a no-op");
    assert_eq!(manager.state(), LifecycleState::Idle);
    assert_eq!(provisioner.terminate_calls(), 1, "terminate ran exactly once");
}

#[rstest]
#[tokio::test]
async fn transient_terminate_failure_falls_back_to_self_shutdown(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    provisioner.fail_terminate(FakeProvisionerError::transient("instance is being deleted"));
    let runner = ScriptedRunner::new();
    runner.push_success(); // master
    runner.push_success(); // fallback shutdown
    runner.push_success(); // -O exit
    let mut manager = manager(&provisioner, &runner, config);
    manager.open(&request).await.expect("open should succeed");

    manager
        .close()
        .await
        .expect("teardown errors must not propagate");

    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(crate::test_support::CommandInvocation::command_string)
        .collect();
    assert!(
        commands
            .iter()
            .any(|command| command.ends_with("sudo shutdown -h +1")),
        "expected the delayed self-shutdown fallback, got: {commands:?}"
    );
    assert!(
        commands.iter().any(|command| command.contains("-O exit")),
        "connection should still be closed normally"
    );
    assert_eq!(manager.state(), LifecycleState::Idle);
}

#[rstest]
#[tokio::test]
async fn close_attempts_every_instance_even_when_termination_fails(
    config: ConnectConfig,
    paired_request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    provisioner.fail_terminate(FakeProvisionerError::transient("instance is being deleted"));
    let runner = ScriptedRunner::new();
    runner.push_success(); // master
    runner.push_success(); // fallback shutdown
    runner.push_success(); // -O exit
    let mut manager = manager(&provisioner, &runner, config);
    manager
        .open(&paired_request)
        .await
        .expect("open should succeed");

    manager
        .close()
        .await
        .expect("teardown errors must not propagate");

    assert_eq!(
        provisioner.terminated_ids(),
        ["fake-0", "fake-1"],
        "a failing teardown still visits every id in the handle"
    );
    assert_eq!(manager.state(), LifecycleState::Idle);
}

#[rstest]
#[tokio::test]
async fn fatal_terminate_failure_is_swallowed_without_fallback(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    provisioner.fail_terminate(FakeProvisionerError::fatal("forbidden"));
    let runner = ScriptedRunner::new();
    runner.push_success(); // master
    runner.push_success(); // -O exit
    let mut manager = manager(&provisioner, &runner, config);
    manager.open(&request).await.expect("open should succeed");

    manager.close().await.expect("cleanup errors are swallowed");

    assert!(
        !runner
            .invocations()
            .iter()
            .any(|invocation| invocation.command_string().contains("shutdown")),
        "no self-shutdown for non-transient errors"
    );
    assert_eq!(manager.state(), LifecycleState::Idle);
}

#[rstest]
#[tokio::test]
async fn close_surfaces_a_session_that_refuses_to_close(
    config: ConnectConfig,
    request: InstanceRequest,
) {
    let provisioner = FakeProvisioner::new();
    let runner = ScriptedRunner::new();
    runner.push_success(); // master; no response queued for -O exit
    let mut manager = manager(&provisioner, &runner, config);
    manager.open(&request).await.expect("open should succeed");

    let err = manager
        .close()
        .await
        .expect_err("an unclosable session must surface");

    assert!(matches!(err, LifecycleError::ConnectionStillOpen));
}

#[rstest]
#[tokio::test]
async fn open_rejects_reentry_while_connected(config: ConnectConfig, request: InstanceRequest) {
    let provisioner = FakeProvisioner::new();
    let runner = ScriptedRunner::new();
    runner.push_success();
    let mut manager = manager(&provisioner, &runner, config);
    manager.open(&request).await.expect("open should succeed");

    let err = manager
        .open(&request)
        .await
        .expect_err("second open must be rejected");
    assert!(matches!(err, LifecycleError::AlreadyOpen));
    assert_eq!(provisioner.provision_calls(), 1);
}
