//! Orchestrates one instance pipeline per image.
//!
//! Every image runs in its own tokio task: resolve the image, build and
//! provision the instance, wait for readiness, optionally apply kernel
//! arguments and reboot, hand the host to the test executor, collect the
//! serial console and tear down. Each task reports exactly one
//! [`TestOutcome`] on the results channel; failures never cross tasks.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{error, info, warn};

use crate::image_config::ImageSpec;
use crate::lifecycle::{
    ImageResolver, InstanceProvisioner, InstanceSpecBuilder, KernelArgumentReconfigurer,
    KernelUpdate, LifecycleError, LifecycleTeardown, ProvisionOutcome, ReadinessBudgets,
    ReadinessPoller, RebootCoordinator, RebootPolicy, ResolvedImage,
};
use crate::provider::{ComputeApi, InstanceRequest};
use crate::remote::{HostRegistry, RemoteExecError, RemoteExecutor, RemoteFuture};
use crate::retry::Clock;
use crate::util::write_string_ambient;

/// Serial port whose output is archived after a run.
pub const SERIAL_PORT: u32 = 1;

const SERIAL_LOG_FILE: &str = "serial-1.log";
const DEFAULT_WORKSPACE_ROOT: &str = "/tmp/node-e2e";

/// Errors reported for a single image.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunError {
    /// Raised when the instance could not be brought to a testable state.
    #[error("unable to prepare instance for image {image}: {source}")]
    Lifecycle {
        /// Short name of the image.
        image: String,
        /// Underlying lifecycle failure.
        #[source]
        source: LifecycleError,
    },
    /// Raised when the test suite fails on the host.
    #[error("test suite failed on {host}: {source}")]
    Suite {
        /// Host the suite ran on.
        host: String,
        /// Remote failure.
        #[source]
        source: RemoteExecError,
    },
}

/// Result of one image pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestOutcome {
    /// Short name of the image.
    pub image: String,
    /// Image description, once the image was resolved.
    pub description: Option<String>,
    /// Instance name, once one was allocated.
    pub host: Option<String>,
    /// Output of the test suite.
    pub output: String,
    /// Failure, if any.
    pub error: Option<RunError>,
}

impl TestOutcome {
    fn new(image: &str) -> Self {
        Self {
            image: image.to_owned(),
            description: None,
            host: None,
            output: String::new(),
            error: None,
        }
    }

    /// Returns `true` when the pipeline and the suite succeeded.
    #[must_use]
    pub const fn exit_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Test suite invocation on a ready host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestRequest {
    /// Target host.
    pub host: String,
    /// Image description, for reports.
    pub description: String,
    /// Command to run, as an argument vector.
    pub command: Vec<String>,
    /// Whether remote artefacts are removed afterwards.
    pub cleanup: bool,
}

/// Runs the test suite on a host.
pub trait TestExecutor: Send + Sync {
    /// Runs the suite described by `request` and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError`] when the suite cannot run or fails.
    fn run_suite<'a>(&'a self, request: &'a TestRequest) -> RemoteFuture<'a>;
}

/// [`TestExecutor`] running a command inside a per-host workspace.
pub struct RemoteCommandSuite {
    remote: Arc<dyn RemoteExecutor>,
    workspace_root: String,
}

impl RemoteCommandSuite {
    /// Creates a suite running commands through `remote`.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            remote,
            workspace_root: DEFAULT_WORKSPACE_ROOT.to_owned(),
        }
    }

    /// Overrides the workspace root.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<String>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Workspace directory used on `host`.
    #[must_use]
    pub fn workspace_for(&self, host: &str) -> String {
        format!("{}-{host}", self.workspace_root)
    }
}

impl TestExecutor for RemoteCommandSuite {
    fn run_suite<'a>(&'a self, request: &'a TestRequest) -> RemoteFuture<'a> {
        Box::pin(async move {
            let host = request.host.as_str();
            let workspace = self.workspace_for(host);
            self.remote
                .run(host, &["mkdir", "-p", workspace.as_str()])
                .await?;

            let command = request
                .command
                .iter()
                .map(|arg| escape(arg.as_str().into()).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            let script = format!("cd {} && {command}", escape(workspace.as_str().into()));
            info!(instance = host, image = %request.description, "running test suite");
            let result = self.remote.run(host, &["sh", "-c", script.as_str()]).await;

            if request.cleanup
                && let Err(err) = self.remote.run(host, &["rm", "-rf", workspace.as_str()]).await
            {
                warn!(instance = host, error = %err, "failed to clean up workspace");
            }
            result
        })
    }
}

/// Run-wide knobs of the orchestrator.
#[derive(Clone, Debug)]
pub struct RunSettings {
    /// Whether instances are deleted after their pipeline.
    pub delete_instances: bool,
    /// Whether executors clean up remote artefacts.
    pub cleanup: bool,
    /// Directory receiving per-host artefacts.
    pub artifacts_dir: Utf8PathBuf,
    /// Test command.
    pub command: Vec<String>,
    /// Readiness stage budgets.
    pub readiness: ReadinessBudgets,
    /// Reboot budgets.
    pub reboot: RebootPolicy,
}

impl RunSettings {
    /// Creates settings with default budgets.
    #[must_use]
    pub fn new(command: Vec<String>, artifacts_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            delete_instances: true,
            cleanup: false,
            artifacts_dir: artifacts_dir.into(),
            command,
            readiness: ReadinessBudgets::default(),
            reboot: RebootPolicy::default(),
        }
    }
}

/// Collaborators shared by every pipeline.
#[derive(Clone)]
pub struct Services {
    /// Provider client.
    pub compute: Arc<dyn ComputeApi>,
    /// Remote command transport.
    pub remote: Arc<dyn RemoteExecutor>,
    /// Host name to address map used by `remote`.
    pub registry: HostRegistry,
    /// Clock driving every polling stage.
    pub clock: Arc<dyn Clock>,
    /// Test suite runner.
    pub executor: Arc<dyn TestExecutor>,
}

struct Pipeline {
    services: Services,
    builder: InstanceSpecBuilder,
    settings: RunSettings,
}

/// Launches one pipeline per image.
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(services: Services, builder: InstanceSpecBuilder, settings: RunSettings) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                services,
                builder,
                settings,
            }),
        }
    }

    /// Spawns one task per spec and returns how many outcomes will arrive on
    /// `results`. Must be called within a tokio runtime.
    pub fn start(&self, specs: Vec<ImageSpec>, results: &UnboundedSender<TestOutcome>) -> usize {
        let mut launched = 0;
        for spec in specs {
            let pipeline = Arc::clone(&self.pipeline);
            let sender = results.clone();
            info!(
                image = %spec.short_name,
                project = %spec.project,
                "initializing e2e tests"
            );
            tokio::spawn(async move {
                let outcome = pipeline.run_image(spec).await;
                if sender.send(outcome).is_err() {
                    warn!("results receiver dropped before the outcome was delivered");
                }
            });
            launched += 1;
        }
        launched
    }

    /// Runs every spec and collects the outcomes in completion order.
    pub async fn run_all(&self, specs: Vec<ImageSpec>) -> Vec<TestOutcome> {
        let (sender, mut receiver) = unbounded_channel();
        let expected = self.start(specs, &sender);
        drop(sender);
        let mut outcomes = Vec::with_capacity(expected);
        while outcomes.len() < expected {
            match receiver.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes
    }
}

impl Pipeline {
    async fn run_image(&self, spec: ImageSpec) -> TestOutcome {
        let mut outcome = TestOutcome::new(&spec.short_name);
        let (resolved, request) = match self.prepare(&spec).await {
            Ok(prepared) => prepared,
            Err(source) => {
                error!(image = %spec.short_name, error = %source, "image preparation failed");
                outcome.error = Some(RunError::Lifecycle {
                    image: spec.short_name,
                    source,
                });
                return outcome;
            }
        };
        let host = request.name.clone();
        outcome.host = Some(host.clone());
        outcome.description = Some(resolved.description.clone());

        let (provisioned, result) = self.test_host(&resolved, &request).await;

        if provisioned && self.settings.delete_instances {
            LifecycleTeardown::new(self.compute(), self.builder.placement())
                .delete(&host)
                .await;
            self.services.registry.remove(&host);
        }

        match result {
            Ok(output) => outcome.output = output,
            Err(err) => {
                error!(instance = %host, error = %err, "image run failed");
                if let RunError::Suite { source, .. } = &err {
                    source.output().clone_into(&mut outcome.output);
                }
                outcome.error = Some(err);
            }
        }
        outcome
    }

    fn compute(&self) -> &dyn ComputeApi {
        self.services.compute.as_ref()
    }

    async fn prepare(
        &self,
        spec: &ImageSpec,
    ) -> Result<(ResolvedImage, InstanceRequest), LifecycleError> {
        let image = ImageResolver::new(Arc::clone(&self.services.compute))
            .image_name(spec)
            .await?;
        let resolved = self.builder.resolve_image(spec, image)?;
        let request = self.builder.build(self.compute(), &resolved).await?;
        Ok((resolved, request))
    }

    /// Brings the host up and runs the suite. The flag reports whether an
    /// instance was created or adopted; a refused or failed provisioning
    /// leaves nothing for teardown to remove.
    async fn test_host(
        &self,
        resolved: &ResolvedImage,
        request: &InstanceRequest,
    ) -> (bool, Result<String, RunError>) {
        let lifecycle = |source: LifecycleError| RunError::Lifecycle {
            image: resolved.short_name.clone(),
            source,
        };
        let provisioned = match InstanceProvisioner::new(self.compute(), self.builder.placement())
            .provision(request)
            .await
        {
            Ok(provisioned) => provisioned,
            Err(source) => return (false, Err(lifecycle(source))),
        };

        let host = request.name.as_str();
        if let Err(source) = self.bring_up(resolved, request, &provisioned).await {
            return (true, Err(lifecycle(source)));
        }

        let suite = TestRequest {
            host: host.to_owned(),
            description: resolved.description.clone(),
            command: self.settings.command.clone(),
            cleanup: self.settings.cleanup,
        };
        let result = self.services.executor.run_suite(&suite).await;
        self.archive_serial_output(host).await;
        (
            true,
            result.map_err(|source| RunError::Suite {
                host: host.to_owned(),
                source,
            }),
        )
    }

    async fn bring_up(
        &self,
        resolved: &ResolvedImage,
        request: &InstanceRequest,
        provisioned: &ProvisionOutcome,
    ) -> Result<(), LifecycleError> {
        let placement = self.builder.placement();
        let remote = self.services.remote.as_ref();
        let clock = self.services.clock.as_ref();
        let host = request.name.as_str();

        ReadinessPoller::new(
            self.compute(),
            remote,
            &self.services.registry,
            clock,
            placement,
        )
        .with_budgets(self.settings.readiness)
        .wait_ready(host, provisioned.operation(), &request.metadata)
        .await?;

        let update = KernelArgumentReconfigurer::new(remote)
            .apply(host, resolved.family, &resolved.kernel_arguments)
            .await?;
        if update == KernelUpdate::Applied {
            RebootCoordinator::new(remote, clock)
                .with_policy(self.settings.reboot)
                .reboot(host)
                .await?;
        }

        self.register_address(host).await
    }

    async fn register_address(&self, host: &str) -> Result<(), LifecycleError> {
        let record = self
            .compute()
            .get_instance(self.builder.placement(), host)
            .await?;
        match record {
            Some(instance) if instance.status.is_running() => {
                if let Some(ip) = instance.external_ip.as_deref() {
                    self.services.registry.register(host, ip);
                }
                Ok(())
            }
            Some(instance) => Err(LifecycleError::NotRunning {
                instance: host.to_owned(),
                status: instance.status.to_string(),
            }),
            None => Err(LifecycleError::NotRunning {
                instance: host.to_owned(),
                status: String::from("MISSING"),
            }),
        }
    }

    async fn archive_serial_output(&self, host: &str) {
        let contents = match self
            .compute()
            .serial_port_output(self.builder.placement(), host, SERIAL_PORT)
            .await
        {
            Ok(contents) => contents,
            Err(err) => {
                error!(instance = host, error = %err, "failed to collect serial output");
                return;
            }
        };
        let path = serial_log_path(&self.settings.artifacts_dir, host);
        if let Err(err) = write_string_ambient(&path, &contents) {
            error!(instance = host, path = %path, error = %err, "failed to write serial output");
        }
    }
}

/// Location of the archived serial console of `host`.
#[must_use]
pub fn serial_log_path(artifacts_dir: &Utf8Path, host: &str) -> Utf8PathBuf {
    artifacts_dir.join(host).join(SERIAL_LOG_FILE)
}
