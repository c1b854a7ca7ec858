//! Readiness polling from "just created" to "ready for tests".

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::info;

use crate::metadata::{Metadata, uses_cloud_init};
use crate::provider::{ComputeApi, InstanceRecord, OperationHandle, Placement};
use crate::remote::{HostRegistry, RemoteExecutor};
use crate::retry::{Attempt, Clock, RetryError, RetryPolicy, poll_until};

use super::LifecycleError;

/// Trivial command proving the host accepts SSH sessions.
pub const SSH_PROBE: [&str; 2] = ["uname", "-r"];

/// Lists running container runtime services.
pub const CONTAINER_RUNTIME_PROBE: [&str; 3] = [
    "sh",
    "-c",
    "systemctl list-units --type=service --state=running | grep -e containerd -e crio",
];

/// Succeeds once cloud-init has finished.
pub const CLOUD_INIT_PROBE: [&str; 2] = ["ls", "/var/lib/cloud/instance/boot-finished"];

const RUNTIME_SERVICES: [&str; 2] = ["containerd.service", "crio.service"];

/// Readiness stages in the order they are traversed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum ReadinessStage {
    /// The creation operation reached `DONE`.
    OperationDone,
    /// The instance reports `RUNNING`.
    InstanceRunning,
    /// A trivial SSH command succeeds.
    SshReachable,
    /// containerd or CRI-O is running.
    ContainerRuntimePresent,
    /// cloud-init wrote its completion marker.
    CloudInitComplete,
}

impl ReadinessStage {
    /// Stable identifier used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OperationDone => "operation-done",
            Self::InstanceRunning => "instance-running",
            Self::SshReachable => "ssh-reachable",
            Self::ContainerRuntimePresent => "container-runtime-present",
            Self::CloudInitComplete => "cloud-init-complete",
        }
    }
}

impl fmt::Display for ReadinessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry budget of each readiness stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessBudgets {
    /// Operation completion.
    pub operation: RetryPolicy,
    /// Running status.
    pub running: RetryPolicy,
    /// SSH reachability.
    pub ssh: RetryPolicy,
    /// Container runtime presence.
    pub container_runtime: RetryPolicy,
    /// cloud-init completion.
    pub cloud_init: RetryPolicy,
}

const STAGE_INTERVAL: Duration = Duration::from_secs(20);

impl Default for ReadinessBudgets {
    fn default() -> Self {
        let standard = RetryPolicy::new(STAGE_INTERVAL, 30);
        Self {
            operation: standard,
            running: standard,
            ssh: standard,
            container_runtime: standard,
            cloud_init: RetryPolicy::new(STAGE_INTERVAL, 60),
        }
    }
}

/// Instance that passed every readiness stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadyInstance {
    /// Instance name.
    pub name: String,
    /// External NAT address, when one was assigned.
    pub external_ip: Option<String>,
    /// Stages traversed, in order.
    pub stages: Vec<ReadinessStage>,
}

/// Drives an instance through the readiness stages.
pub struct ReadinessPoller<'a> {
    compute: &'a dyn ComputeApi,
    remote: &'a dyn RemoteExecutor,
    registry: &'a HostRegistry,
    clock: &'a dyn Clock,
    placement: &'a Placement,
    budgets: ReadinessBudgets,
}

impl<'a> ReadinessPoller<'a> {
    /// Creates a poller with the default budgets.
    #[must_use]
    pub fn new(
        compute: &'a dyn ComputeApi,
        remote: &'a dyn RemoteExecutor,
        registry: &'a HostRegistry,
        clock: &'a dyn Clock,
        placement: &'a Placement,
    ) -> Self {
        Self {
            compute,
            remote,
            registry,
            clock,
            placement,
            budgets: ReadinessBudgets::default(),
        }
    }

    /// Replaces the stage budgets.
    #[must_use]
    pub const fn with_budgets(mut self, budgets: ReadinessBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Waits until `name` is ready. `operation` is `None` for adopted
    /// instances, which skip the operation stage. The cloud-init stage runs
    /// only when `metadata` carries a cloud-config `user-data` document.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ReadinessTimeout`] for the first stage that
    /// exhausts its budget and [`LifecycleError::OperationFailed`] when the
    /// creation operation finishes with errors. Later stages are not entered
    /// after a failure.
    pub async fn wait_ready(
        &self,
        name: &str,
        operation: Option<&OperationHandle>,
        metadata: &Metadata,
    ) -> Result<ReadyInstance, LifecycleError> {
        let mut stages = Vec::new();

        if let Some(handle) = operation {
            self.wait_operation(name, &handle.name).await?;
            stages.push(ReadinessStage::OperationDone);
        }

        let instance = self.wait_running(name).await?;
        if let Some(ip) = instance.external_ip.as_deref() {
            self.registry.register(name, ip);
        }
        stages.push(ReadinessStage::InstanceRunning);

        self.run_stage(name, ReadinessStage::SshReachable, self.budgets.ssh, |_| async move {
            match self.remote.run(name, &SSH_PROBE).await {
                Ok(_) => Attempt::Ready(()),
                Err(err) => Attempt::Pending(err.to_string()),
            }
        })
        .await?;
        stages.push(ReadinessStage::SshReachable);

        self.run_stage(
            name,
            ReadinessStage::ContainerRuntimePresent,
            self.budgets.container_runtime,
            |_| async move { self.probe_container_runtime(name).await },
        )
        .await?;
        stages.push(ReadinessStage::ContainerRuntimePresent);

        if uses_cloud_init(metadata) {
            self.run_stage(
                name,
                ReadinessStage::CloudInitComplete,
                self.budgets.cloud_init,
                |_| async move {
                    match self.remote.run(name, &CLOUD_INIT_PROBE).await {
                        Ok(_) => Attempt::Ready(()),
                        Err(err) => Attempt::Pending(format!(
                            "cloud-init has not finished: {}",
                            err.output().trim()
                        )),
                    }
                },
            )
            .await?;
            stages.push(ReadinessStage::CloudInitComplete);
        }

        info!(instance = name, "instance ready");
        Ok(ReadyInstance {
            name: name.to_owned(),
            external_ip: instance.external_ip,
            stages,
        })
    }

    async fn wait_operation(&self, name: &str, operation: &str) -> Result<(), LifecycleError> {
        self.run_stage(
            name,
            ReadinessStage::OperationDone,
            self.budgets.operation,
            |_| async move {
                match self.compute.get_operation(self.placement, operation).await {
                    Err(err) => Attempt::Pending(format!("operation lookup failed: {err}")),
                    Ok(handle) if !handle.is_done() => {
                        Attempt::Pending(format!("operation {operation} is {}", handle.status))
                    }
                    Ok(handle) if handle.has_errors() => Attempt::Fatal(handle.error_summary()),
                    Ok(_) => Attempt::Ready(()),
                }
            },
        )
        .await
    }

    async fn wait_running(&self, name: &str) -> Result<InstanceRecord, LifecycleError> {
        self.run_stage(
            name,
            ReadinessStage::InstanceRunning,
            self.budgets.running,
            |_| async move {
                match self.compute.get_instance(self.placement, name).await {
                    Err(err) => Attempt::Pending(format!("instance lookup failed: {err}")),
                    Ok(None) => Attempt::Pending(String::from("instance not found")),
                    Ok(Some(record)) if !record.status.is_running() => Attempt::Pending(format!(
                        "instance {name} not in state RUNNING, was {}",
                        record.status
                    )),
                    Ok(Some(record)) => Attempt::Ready(record),
                }
            },
        )
        .await
    }

    async fn probe_container_runtime(&self, name: &str) -> Attempt<(), String> {
        match self.remote.run(name, &CONTAINER_RUNTIME_PROBE).await {
            Ok(output) if RUNTIME_SERVICES.iter().any(|svc| output.contains(svc)) => {
                Attempt::Ready(())
            }
            Ok(output) => Attempt::Pending(format!(
                "instance {name} not running containerd/crio daemon: {}",
                output.trim()
            )),
            Err(err) => Attempt::Pending(format!(
                "instance {name} not running containerd/crio daemon - command failed: {}",
                err.output().trim()
            )),
        }
    }

    async fn run_stage<T, F, Fut>(
        &self,
        name: &str,
        stage: ReadinessStage,
        policy: RetryPolicy,
        probe: F,
    ) -> Result<T, LifecycleError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, String>>,
    {
        match poll_until(self.clock, policy, stage.as_str(), probe).await {
            Ok(value) => {
                info!(instance = name, stage = %stage, "readiness stage passed");
                Ok(value)
            }
            Err(RetryError::Exhausted { attempts, last }) => Err(LifecycleError::ReadinessTimeout {
                instance: name.to_owned(),
                stage,
                attempts,
                last,
            }),
            Err(RetryError::Aborted(message)) => Err(LifecycleError::OperationFailed {
                instance: name.to_owned(),
                message,
            }),
        }
    }
}
