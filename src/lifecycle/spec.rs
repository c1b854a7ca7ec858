//! Instance request construction.
//!
//! [`InstanceSpecBuilder`] turns an image spec and the run-wide settings into
//! a [`ResolvedImage`], and a resolved image into a provider-ready
//! [`InstanceRequest`].

use uuid::Uuid;

use crate::image_config::{Accelerator, ImageSpec};
use crate::metadata::{self, Metadata, MetadataDecoder};
use crate::provider::{
    BootDisk, ComputeApi, GuestAccelerator, InstanceRequest, NetworkAccess, Placement,
    Scheduling, ServiceAccount,
};

use super::LifecycleError;
use super::kernel::ImageFamily;

/// Machine type used when neither the image nor the run configures one.
pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-1";

/// Boot disk size in GB.
pub const BOOT_DISK_SIZE_GB: u64 = 20;

/// Scope granted to the instance service account.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const ACCELERATOR_TYPE_BASE: &str = "https://www.googleapis.com/compute/v1/projects";

/// Image selection with every per-image setting settled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedImage {
    /// Short name of the image in the run.
    pub short_name: String,
    /// Concrete image name.
    pub image: String,
    /// Project hosting the image.
    pub project: String,
    /// Description used in reports.
    pub description: String,
    /// Merged metadata.
    pub metadata: Metadata,
    /// Machine type override from the image spec.
    pub machine: Option<String>,
    /// Machine type in `zones/<zone>/machineTypes/<type>` form.
    pub machine_type: String,
    /// Kernel arguments, in order.
    pub kernel_arguments: Vec<String>,
    /// Family classification of the image.
    pub family: ImageFamily,
    /// Guest accelerators.
    pub accelerators: Vec<Accelerator>,
}

/// Builds instance requests from image specs and run-wide settings.
#[derive(Clone, Debug)]
pub struct InstanceSpecBuilder {
    placement: Placement,
    name_prefix: String,
    instance_type: String,
    preemptible: bool,
    decoder: MetadataDecoder,
    global_metadata: String,
    node_envs: Metadata,
}

impl InstanceSpecBuilder {
    /// Creates a builder for instances in `placement` named after
    /// `name_prefix`.
    #[must_use]
    pub fn new(placement: Placement, name_prefix: impl Into<String>) -> Self {
        Self {
            placement,
            name_prefix: name_prefix.into(),
            instance_type: String::new(),
            preemptible: false,
            decoder: MetadataDecoder::new(),
            global_metadata: String::new(),
            node_envs: Metadata::new(),
        }
    }

    /// Sets the run-wide instance type.
    #[must_use]
    pub fn instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    /// Sets the preemptible flag.
    #[must_use]
    pub const fn preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    /// Sets the metadata decoder.
    #[must_use]
    pub fn decoder(mut self, decoder: MetadataDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Sets metadata applied to every instance.
    #[must_use]
    pub fn global_metadata(mut self, raw: impl Into<String>) -> Self {
        self.global_metadata = raw.into();
        self
    }

    /// Sets node environment overrides.
    #[must_use]
    pub fn node_envs(mut self, envs: Metadata) -> Self {
        self.node_envs = envs;
        self
    }

    /// Placement of every instance built.
    #[must_use]
    pub const fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Settles `spec` against the concrete `image` name.
    ///
    /// Metadata precedence, lowest first: image, run-wide, node environment.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Metadata`] when either metadata string fails
    /// to decode.
    pub fn resolve_image(
        &self,
        spec: &ImageSpec,
        image: String,
    ) -> Result<ResolvedImage, LifecycleError> {
        let image_metadata = self.decoder.decode(&spec.metadata)?;
        let global_metadata = self.decoder.decode(&self.global_metadata)?;
        let merged = metadata::merge([&image_metadata, &global_metadata, &self.node_envs]);
        let description = spec.description.clone().unwrap_or_else(|| image.clone());
        Ok(ResolvedImage {
            short_name: spec.short_name.clone(),
            family: ImageFamily::classify(&image),
            project: spec.project.clone(),
            description,
            metadata: merged,
            machine: spec.machine.clone(),
            machine_type: self.machine_type(spec.machine.as_deref()),
            kernel_arguments: spec.kernel_arguments.clone(),
            accelerators: spec.accelerators.clone(),
            image,
        })
    }

    /// Returns the zonal machine type path for an optional override.
    #[must_use]
    pub fn machine_type(&self, machine: Option<&str>) -> String {
        let chosen = machine
            .filter(|value| !value.trim().is_empty())
            .or_else(|| Some(self.instance_type.as_str()).filter(|value| !value.trim().is_empty()))
            .unwrap_or(DEFAULT_MACHINE_TYPE);
        format!("zones/{}/machineTypes/{chosen}", self.placement.zone)
    }

    /// Derives the instance name.
    ///
    /// Without a machine override the name is `<prefix>-<image>`; with one it
    /// is `<machine>-<image>-<8 hex chars>` so several machine types can test
    /// the same image at once.
    #[must_use]
    pub fn instance_name(&self, resolved: &ResolvedImage) -> String {
        match resolved.machine.as_deref() {
            None => format!("{}-{}", self.name_prefix, resolved.image),
            Some(machine) => {
                let id = Uuid::new_v4().simple().to_string();
                let suffix: String = id.chars().take(8).collect();
                format!("{machine}-{}-{suffix}", resolved.image)
            }
        }
    }

    /// Fetches the project's default service account and builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Provider`] when the service account lookup
    /// fails.
    pub async fn build(
        &self,
        compute: &dyn ComputeApi,
        resolved: &ResolvedImage,
    ) -> Result<InstanceRequest, LifecycleError> {
        let service_account = compute
            .default_service_account(&self.placement.project)
            .await?;
        Ok(self.request_for(resolved, self.instance_name(resolved), service_account))
    }

    /// Builds the request for `resolved` under `name`.
    #[must_use]
    pub fn request_for(
        &self,
        resolved: &ResolvedImage,
        name: String,
        service_account: String,
    ) -> InstanceRequest {
        let accelerators: Vec<GuestAccelerator> = resolved
            .accelerators
            .iter()
            .map(|accelerator| GuestAccelerator {
                accelerator_type: format!(
                    "{ACCELERATOR_TYPE_BASE}/{}/zones/{}/acceleratorTypes/{}",
                    self.placement.project, self.placement.zone, accelerator.accelerator_type
                ),
                count: accelerator.count,
            })
            .collect();
        let scheduling = if accelerators.is_empty() {
            Scheduling {
                preemptible: self.preemptible,
                ..Scheduling::default()
            }
        } else {
            Scheduling {
                preemptible: self.preemptible,
                on_host_maintenance: Some(String::from("TERMINATE")),
                automatic_restart: Some(true),
            }
        };

        InstanceRequest {
            name,
            machine_type: resolved.machine_type.clone(),
            boot_disk: BootDisk {
                source_image: format!(
                    "projects/{}/global/images/{}",
                    resolved.project, resolved.image
                ),
                size_gb: BOOT_DISK_SIZE_GB,
                auto_delete: true,
            },
            network: NetworkAccess {
                access_type: String::from("ONE_TO_ONE_NAT"),
                name: String::from("External NAT"),
            },
            service_account: ServiceAccount {
                email: service_account,
                scopes: vec![String::from(CLOUD_PLATFORM_SCOPE)],
            },
            metadata: resolved.metadata.clone(),
            accelerators,
            scheduling,
        }
    }
}
