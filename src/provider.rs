//! Provider abstraction for the compute API consumed by the lifecycle engine.
//!
//! The lifecycle only ever talks to [`ComputeApi`]; the GCE REST client in
//! [`crate::gce`] is the production implementation and
//! [`crate::test_support::FakeCompute`] is the in-memory double.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Errors raised by provider implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the HTTP request could not be sent or read.
    #[error("transport error: {message}")]
    Transport {
        /// Message returned by the HTTP client.
        message: String,
    },
    /// Raised when the API answers with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body returned by the provider.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("failed to decode {resource}: {message}")]
    Decode {
        /// Resource being decoded.
        resource: String,
        /// Decoder error message.
        message: String,
    },
    /// Raised when no access token can be obtained.
    #[error("failed to acquire credentials: {message}")]
    Auth {
        /// Description of the last credential failure.
        message: String,
    },
}

/// Project and zone every instance of a run lives in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Placement {
    /// Project instances are launched into.
    pub project: String,
    /// Zone instances are launched into.
    pub zone: String,
}

impl Placement {
    /// Creates a placement.
    #[must_use]
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
        }
    }
}

/// Image entry returned by an image listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageRecord {
    /// Image name.
    pub name: String,
    /// Family the image belongs to, when published in one.
    pub family: Option<String>,
    /// RFC 3339 creation timestamp as reported by the provider.
    pub creation_timestamp: String,
}

/// Instance status as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus(String);

impl InstanceStatus {
    /// Status reported once the guest is booted.
    pub const RUNNING: &'static str = "RUNNING";

    /// Wraps a provider status string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw status.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns `true` when the status is `RUNNING`, ignoring case.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.eq_ignore_ascii_case(Self::RUNNING)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a provider-side instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRecord {
    /// Instance name.
    pub name: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Machine type reference, either a URL or a `zones/<z>/machineTypes/<t>`
    /// path.
    pub machine_type: String,
    /// First external NAT address found on the network interfaces.
    pub external_ip: Option<String>,
    /// Instance metadata items.
    pub metadata: BTreeMap<String, String>,
}

/// Status of an asynchronous provider operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum OperationStatus {
    /// Accepted but not yet observed running.
    Pending,
    /// In progress.
    Running,
    /// Finished, successfully or not.
    Done,
}

impl OperationStatus {
    /// Maps a provider status string, treating unknown values as pending.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("DONE") {
            Self::Done
        } else if value.eq_ignore_ascii_case("RUNNING") {
            Self::Running
        } else {
            Self::Pending
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::Running => f.write_str("RUNNING"),
            Self::Done => f.write_str("DONE"),
        }
    }
}

/// Structured error attached to an operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationError {
    /// Provider error code, for example `QUOTA_EXCEEDED`.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Handle for an in-flight provider mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationHandle {
    /// Operation name used for follow-up lookups.
    pub name: String,
    /// Last observed status.
    pub status: OperationStatus,
    /// Errors reported by the provider, empty on success.
    pub errors: Vec<OperationError>,
}

impl OperationHandle {
    /// Returns `true` once the operation reached [`OperationStatus::Done`].
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }

    /// Returns `true` when the provider attached errors to the operation.
    #[must_use]
    pub const fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Joins the attached errors into a single message.
    #[must_use]
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Boot disk definition for a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootDisk {
    /// Image reference in `projects/<p>/global/images/<i>` form.
    pub source_image: String,
    /// Disk size in GB.
    pub size_gb: u64,
    /// Whether the disk is deleted together with the instance.
    pub auto_delete: bool,
}

/// External access configuration for the primary network interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkAccess {
    /// Access configuration type, for example `ONE_TO_ONE_NAT`.
    pub access_type: String,
    /// Access configuration name.
    pub name: String,
}

/// Service account attached to a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceAccount {
    /// Service account email.
    pub email: String,
    /// OAuth scopes granted to the instance.
    pub scopes: Vec<String>,
}

/// Guest accelerator attached to a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GuestAccelerator {
    /// Fully qualified accelerator type URL.
    pub accelerator_type: String,
    /// Number of devices.
    pub count: u32,
}

/// Scheduling policy for a new instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Scheduling {
    /// Whether the provider may reclaim the instance at any time.
    pub preemptible: bool,
    /// Host maintenance behaviour; only set for accelerator-bearing requests.
    pub on_host_maintenance: Option<String>,
    /// Automatic restart flag; only set for accelerator-bearing requests.
    pub automatic_restart: Option<bool>,
}

/// Provider-ready definition of an instance to create.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Instance name, unique within the zone.
    pub name: String,
    /// Machine type in `zones/<z>/machineTypes/<t>` form.
    pub machine_type: String,
    /// Boot disk.
    pub boot_disk: BootDisk,
    /// External access for the primary interface.
    pub network: NetworkAccess,
    /// Service account and scopes.
    pub service_account: ServiceAccount,
    /// Metadata items.
    pub metadata: BTreeMap<String, String>,
    /// Guest accelerators, empty when none are requested.
    pub accelerators: Vec<GuestAccelerator>,
    /// Scheduling policy.
    pub scheduling: Scheduling,
}

/// Compute API surface consumed by the lifecycle engine.
///
/// Implementations must tolerate concurrent calls for distinct instance
/// names.
pub trait ComputeApi: Send + Sync {
    /// Lists every image visible in `project`, following pagination.
    fn list_images<'a>(&'a self, project: &'a str) -> ProviderFuture<'a, Vec<ImageRecord>>;

    /// Fetches an instance, returning `None` when it does not exist.
    fn get_instance<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceRecord>>;

    /// Submits an instance creation request.
    fn insert_instance<'a>(
        &'a self,
        placement: &'a Placement,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, OperationHandle>;

    /// Fetches the current state of a zone operation.
    fn get_operation<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, OperationHandle>;

    /// Reads the console output captured on `port`.
    fn serial_port_output<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
        port: u32,
    ) -> ProviderFuture<'a, String>;

    /// Submits an instance deletion request.
    fn delete_instance<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, OperationHandle>;

    /// Returns the default service account email of `project`.
    fn default_service_account<'a>(&'a self, project: &'a str) -> ProviderFuture<'a, String>;
}
