//! GCE runner: wires configuration, the Compute Engine client and SSH into
//! an [`Orchestrator`].

use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::config::RunnerConfig;
use crate::gce::{GceClient, MetadataServerToken, StaticToken, TokenSource};
use crate::image_config::{ImageSpec, collect_image_specs, load_image_config};
use crate::lifecycle::InstanceSpecBuilder;
use crate::provider::ComputeApi;
use crate::registry::{RunnerError, RunnerFuture, TestRunner};
use crate::remote::{HostRegistry, RemoteExecutor, SshConfig, SshExecutor};
use crate::retry::{Clock, TokioClock};
use crate::run::{Orchestrator, RemoteCommandSuite, RunSettings, Services, TestOutcome};

struct Prepared {
    specs: Vec<ImageSpec>,
    compute: Arc<dyn ComputeApi>,
    remote: Arc<dyn RemoteExecutor>,
    registry: HostRegistry,
    builder: InstanceSpecBuilder,
}

/// [`TestRunner`] provisioning Compute Engine instances.
pub struct GceRunner {
    config: RunnerConfig,
    ssh: SshConfig,
    clock: Arc<dyn Clock>,
    tokens: Option<Arc<dyn TokenSource>>,
    prepared: Option<Prepared>,
}

impl GceRunner {
    /// Creates an unvalidated runner.
    #[must_use]
    pub fn new(config: RunnerConfig, ssh: SshConfig) -> Self {
        Self {
            config,
            ssh,
            clock: Arc::new(TokioClock),
            tokens: None,
            prepared: None,
        }
    }

    /// Replaces the clock used for every wait.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the credential source chosen from configuration.
    #[must_use]
    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Images prepared by validation, ordered by short name.
    #[must_use]
    pub fn image_specs(&self) -> &[ImageSpec] {
        self.prepared
            .as_ref()
            .map_or(&[], |prepared| prepared.specs.as_slice())
    }

    fn token_source(&self) -> Arc<dyn TokenSource> {
        if let Some(tokens) = &self.tokens {
            return Arc::clone(tokens);
        }
        match self.config.access_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Arc::new(StaticToken::new(token)),
            _ => Arc::new(MetadataServerToken::default()),
        }
    }

    fn collect_specs(&self) -> Result<Vec<ImageSpec>, RunnerError> {
        let document = self
            .config
            .image_config_path()
            .map(|path| load_image_config(&path))
            .transpose()?;
        let images = self.config.image_list();
        if document.is_none() && images.is_empty() {
            return Err(RunnerError::NoImages);
        }
        Ok(collect_image_specs(
            document.as_ref(),
            &images,
            self.config.image_project.as_deref(),
        )?)
    }

    async fn prepare(&self) -> Result<Prepared, RunnerError> {
        let specs = self.collect_specs()?;
        self.config.validate(specs.len())?;

        let builder = InstanceSpecBuilder::new(
            self.config.placement(),
            self.config.resolved_name_prefix(),
        )
        .instance_type(self.config.instance_type.clone())
        .preemptible(self.config.preemptible_instances)
        .decoder(self.config.metadata_decoder()?)
        .global_metadata(self.config.instance_metadata.clone().unwrap_or_default())
        .node_envs(self.config.node_envs()?);

        let registry = HostRegistry::new();
        let remote = SshExecutor::with_process_runner(self.ssh.clone(), registry.clone())?;
        let client = GceClient::connect(
            self.token_source(),
            self.clock.as_ref(),
            self.config.compute_api_base.as_deref(),
        )
        .await?;

        info!(
            project = %self.config.project,
            zone = %self.config.zone,
            images = specs.len(),
            "GCE runner validated"
        );
        Ok(Prepared {
            specs,
            compute: Arc::new(client),
            remote: Arc::new(remote),
            registry,
            builder,
        })
    }
}

impl TestRunner for GceRunner {
    fn validate(&mut self) -> RunnerFuture<'_> {
        Box::pin(async move {
            let prepared = self.prepare().await?;
            self.prepared = Some(prepared);
            Ok(())
        })
    }

    fn start_tests(
        &self,
        command: &[String],
        results: &UnboundedSender<TestOutcome>,
    ) -> Result<usize, RunnerError> {
        let prepared = self.prepared.as_ref().ok_or(RunnerError::NotValidated)?;
        let services = Services {
            compute: Arc::clone(&prepared.compute),
            remote: Arc::clone(&prepared.remote),
            registry: prepared.registry.clone(),
            clock: Arc::clone(&self.clock),
            executor: Arc::new(RemoteCommandSuite::new(Arc::clone(&prepared.remote))),
        };
        let settings = RunSettings {
            delete_instances: self.config.delete_instances,
            cleanup: self.config.cleanup_after_tests(),
            ..RunSettings::new(
                command.to_vec(),
                Utf8PathBuf::from(self.config.artifacts_dir.as_str()),
            )
        };
        let orchestrator = Orchestrator::new(services, prepared.builder.clone(), settings);
        Ok(orchestrator.start(prepared.specs.clone(), results))
    }
}
