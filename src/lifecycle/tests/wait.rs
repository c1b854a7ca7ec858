//! Tests for readiness polling.

use std::time::Duration;

use super::{instance, placement};
use crate::lifecycle::{
    LifecycleError, ReadinessBudgets, ReadinessPoller, ReadinessStage, ReadyInstance,
};
use crate::metadata::Metadata;
use crate::provider::{OperationError, OperationHandle, OperationStatus, ProviderError};
use crate::remote::HostRegistry;
use crate::retry::RetryPolicy;
use crate::test_support::{
    FakeClock, FakeCompute, ScriptedRemote, done_operation, operation, remote_failure,
};

const NAME: &str = "tmp-node-e2e-cos-109";
const OPERATION: &str = "operation-insert-tmp-node-e2e-cos-109";

struct Harness {
    compute: FakeCompute,
    remote: ScriptedRemote,
    registry: HostRegistry,
    clock: FakeClock,
}

impl Harness {
    fn new(remote: ScriptedRemote) -> Self {
        let compute = FakeCompute::new();
        compute.add_instance(instance(
            NAME,
            "zones/us-central1-f/machineTypes/e2-medium",
            "RUNNING",
        ));
        Self {
            compute,
            remote,
            registry: HostRegistry::new(),
            clock: FakeClock::new(),
        }
    }

    async fn wait(
        &self,
        operation: Option<&OperationHandle>,
        metadata: &Metadata,
    ) -> Result<ReadyInstance, LifecycleError> {
        let placement = placement();
        ReadinessPoller::new(
            &self.compute,
            &self.remote,
            &self.registry,
            &self.clock,
            &placement,
        )
        .wait_ready(NAME, operation, metadata)
        .await
    }
}

fn pending() -> OperationHandle {
    operation(OPERATION, OperationStatus::Running)
}

fn cloud_init_metadata() -> Metadata {
    Metadata::from([(
        String::from("user-data"),
        String::from("#cloud-config\nruncmd: []\n"),
    )])
}

#[tokio::test]
async fn healthy_instance_passes_every_stage_without_sleeping() {
    let harness = Harness::new(ScriptedRemote::healthy());

    let ready = harness
        .wait(Some(&pending()), &Metadata::new())
        .await
        .expect("instance becomes ready");

    assert_eq!(
        ready.stages,
        vec![
            ReadinessStage::OperationDone,
            ReadinessStage::InstanceRunning,
            ReadinessStage::SshReachable,
            ReadinessStage::ContainerRuntimePresent,
        ]
    );
    assert_eq!(ready.external_ip.as_deref(), Some("198.51.100.4"));
    assert_eq!(
        harness.registry.lookup(NAME).as_deref(),
        Some("198.51.100.4")
    );
    assert!(harness.clock.sleeps().is_empty());
    assert_eq!(harness.remote.count("uname -r"), 1);
    assert_eq!(harness.remote.count("boot-finished"), 0);
}

#[tokio::test]
async fn pending_operation_is_polled_at_stage_interval() {
    let harness = Harness::new(ScriptedRemote::healthy());
    harness.compute.script_operation(
        OPERATION,
        [
            Ok(operation(OPERATION, OperationStatus::Pending)),
            Err(ProviderError::Transport {
                message: String::from("timeout"),
            }),
            Ok(done_operation(OPERATION)),
        ],
    );

    harness
        .wait(Some(&pending()), &Metadata::new())
        .await
        .expect("instance becomes ready");

    assert_eq!(harness.compute.count("get_operation"), 3);
    assert_eq!(harness.clock.sleeps(), vec![Duration::from_secs(20); 2]);
}

#[tokio::test]
async fn finished_operation_with_errors_is_fatal() {
    let harness = Harness::new(ScriptedRemote::healthy());
    harness.compute.script_operation(
        OPERATION,
        [Ok(OperationHandle {
            errors: vec![OperationError {
                code: String::from("RESOURCE_NOT_FOUND"),
                message: String::from("image not found"),
            }],
            ..done_operation(OPERATION)
        })],
    );

    let err = harness
        .wait(Some(&pending()), &Metadata::new())
        .await
        .expect_err("operation failed");

    assert_eq!(
        err,
        LifecycleError::OperationFailed {
            instance: String::from(NAME),
            message: String::from("RESOURCE_NOT_FOUND: image not found"),
        }
    );
    assert_eq!(harness.compute.count("get_instance"), 0);
    assert!(harness.clock.sleeps().is_empty());
}

#[tokio::test]
async fn adopted_instance_skips_operation_stage() {
    let harness = Harness::new(ScriptedRemote::healthy());

    let ready = harness
        .wait(None, &Metadata::new())
        .await
        .expect("instance becomes ready");

    assert_eq!(ready.stages.first(), Some(&ReadinessStage::InstanceRunning));
    assert_eq!(harness.compute.count("get_operation"), 0);
}

#[tokio::test]
async fn non_running_status_is_retried() {
    let harness = Harness::new(ScriptedRemote::healthy());
    harness
        .compute
        .script_statuses(NAME, &["PROVISIONING", "STAGING", "RUNNING"]);

    harness
        .wait(None, &Metadata::new())
        .await
        .expect("instance becomes ready");

    assert_eq!(harness.compute.count("get_instance"), 3);
    assert_eq!(harness.clock.sleeps().len(), 2);
}

#[tokio::test]
async fn missing_container_runtime_times_out_without_later_stages() {
    let remote = ScriptedRemote::new();
    remote.succeed("systemctl", "");
    let harness = Harness::new(remote);

    let err = harness
        .wait(None, &cloud_init_metadata())
        .await
        .expect_err("runtime never appears");

    let LifecycleError::ReadinessTimeout {
        ref instance,
        stage,
        attempts,
        ..
    } = err
    else {
        panic!("expected a readiness timeout, got {err:?}");
    };
    assert_eq!(instance, NAME);
    assert_eq!(stage, ReadinessStage::ContainerRuntimePresent);
    assert_eq!(attempts, 30);
    assert_eq!(harness.clock.sleeps(), vec![Duration::from_secs(20); 29]);
    assert_eq!(harness.remote.count("boot-finished"), 0);
}

#[tokio::test]
async fn ssh_timeout_reports_last_failure() {
    let remote = ScriptedRemote::new();
    remote.respond("uname", [Err(remote_failure(NAME, "Connection refused"))]);
    let harness = Harness::new(remote);
    let placement = placement();
    let budgets = ReadinessBudgets {
        ssh: RetryPolicy::new(Duration::from_secs(1), 3),
        ..ReadinessBudgets::default()
    };

    let err = ReadinessPoller::new(
        &harness.compute,
        &harness.remote,
        &harness.registry,
        &harness.clock,
        &placement,
    )
    .with_budgets(budgets)
    .wait_ready(NAME, None, &Metadata::new())
    .await
    .expect_err("ssh never answers");

    assert!(matches!(
        err,
        LifecycleError::ReadinessTimeout {
            stage: ReadinessStage::SshReachable,
            attempts: 3,
            ref last,
            ..
        } if last.contains("Connection refused")
    ));
    assert_eq!(harness.remote.count("systemctl"), 0);
}

#[tokio::test]
async fn ssh_retries_then_advances_to_container_runtime() {
    let remote = ScriptedRemote::healthy();
    remote.respond(
        "uname",
        [
            Err(remote_failure(NAME, "Connection refused")),
            Err(remote_failure(NAME, "Connection timed out")),
            Ok(String::from("6.1.58+\n")),
        ],
    );
    let harness = Harness::new(remote);

    let ready = harness
        .wait(None, &Metadata::new())
        .await
        .expect("ssh answers on the third attempt");

    assert_eq!(
        ready.stages,
        vec![
            ReadinessStage::InstanceRunning,
            ReadinessStage::SshReachable,
            ReadinessStage::ContainerRuntimePresent,
        ]
    );
    assert_eq!(harness.remote.count("uname -r"), 3);
    assert_eq!(harness.remote.count("systemctl"), 1);
    assert_eq!(harness.clock.sleeps(), vec![Duration::from_secs(20); 2]);
}

#[tokio::test]
async fn cloud_init_stage_runs_only_for_cloud_config_user_data() {
    let remote = ScriptedRemote::healthy();
    remote.respond(
        "boot-finished",
        [
            Err(remote_failure(NAME, "No such file or directory")),
            Ok(String::from("/var/lib/cloud/instance/boot-finished")),
        ],
    );
    let harness = Harness::new(remote);

    let ready = harness
        .wait(None, &cloud_init_metadata())
        .await
        .expect("instance becomes ready");

    assert_eq!(ready.stages.last(), Some(&ReadinessStage::CloudInitComplete));
    assert_eq!(harness.remote.count("boot-finished"), 2);
}

#[tokio::test]
async fn plain_user_data_does_not_wait_for_cloud_init() {
    let harness = Harness::new(ScriptedRemote::healthy());
    let metadata = Metadata::from([(
        String::from("user-data"),
        String::from("#!/bin/bash\necho hi\n"),
    )]);

    let ready = harness
        .wait(None, &metadata)
        .await
        .expect("instance becomes ready");

    assert!(!ready.stages.contains(&ReadinessStage::CloudInitComplete));
    assert_eq!(harness.remote.count("boot-finished"), 0);
}

#[tokio::test]
async fn crio_counts_as_container_runtime() {
    let remote = ScriptedRemote::new();
    remote.succeed("systemctl", "crio.service loaded active running CRI-O");
    let harness = Harness::new(remote);

    let ready = harness
        .wait(None, &Metadata::new())
        .await
        .expect("instance becomes ready");

    assert!(ready.stages.contains(&ReadinessStage::ContainerRuntimePresent));
}
