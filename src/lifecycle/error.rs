//! Errors raised by lifecycle stages.

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::provider::ProviderError;
use crate::remote::RemoteExecError;

use super::wait::ReadinessStage;

/// Errors raised while taking an instance from image selection to handoff.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised when no listed image passes the filters.
    #[error("no image in project {project} matches regex `{regex}` and family `{family}`")]
    NoMatchingImage {
        /// Project that was listed.
        project: String,
        /// Regex filter, empty when unused.
        regex: String,
        /// Family filter, empty when unused.
        family: String,
    },
    /// Raised when the image regex does not compile.
    #[error("invalid image regex `{pattern}`: {message}")]
    InvalidRegex {
        /// Pattern as configured.
        pattern: String,
        /// Compiler message.
        message: String,
    },
    /// Raised when a candidate image carries an unparsable timestamp.
    #[error("image {image} has invalid creation timestamp `{value}`: {message}")]
    TimestampParse {
        /// Image carrying the timestamp.
        image: String,
        /// Raw timestamp.
        value: String,
        /// Parser message.
        message: String,
    },
    /// Raised when image metadata cannot be decoded.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// Raised when a provider call fails.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Raised when an existing instance with the target name has a different
    /// machine type.
    #[error(
        "instance {instance} already exists with machine type {actual}, expected {expected}; delete it or change the name prefix"
    )]
    StaleInstance {
        /// Instance name.
        instance: String,
        /// Requested machine type.
        expected: String,
        /// Machine type of the existing instance.
        actual: String,
    },
    /// Raised when the provider attaches errors to an operation.
    #[error("could not create instance {instance}: {message}")]
    OperationFailed {
        /// Instance name.
        instance: String,
        /// Joined provider error list.
        message: String,
    },
    /// Raised when a readiness stage exhausts its budget.
    #[error("instance {instance} not ready at {stage} after {attempts} attempts: {last}")]
    ReadinessTimeout {
        /// Instance name.
        instance: String,
        /// Stage that timed out.
        stage: ReadinessStage,
        /// Attempts performed.
        attempts: u32,
        /// Last observed condition.
        last: String,
    },
    /// Raised when the instance is no longer running at handoff.
    #[error("instance {instance} is {status}, expected RUNNING")]
    NotRunning {
        /// Instance name.
        instance: String,
        /// Observed status, or `MISSING`.
        status: String,
    },
    /// Raised when the kernel argument update command fails.
    #[error("failed to update kernel arguments on {instance}: {source}")]
    KernelArguments {
        /// Instance name.
        instance: String,
        /// Remote failure.
        source: RemoteExecError,
    },
    /// Raised when the instance keeps answering after the reboot request.
    #[error("instance {instance} still responds to SSH after {attempts} attempts")]
    NeverWentDown {
        /// Instance name.
        instance: String,
        /// Attempts performed.
        attempts: u32,
    },
    /// Raised when the instance does not answer again after rebooting.
    #[error("instance {instance} does not respond to SSH after {attempts} attempts: {last}")]
    NeverCameBack {
        /// Instance name.
        instance: String,
        /// Attempts performed.
        attempts: u32,
        /// Last remote failure.
        last: String,
    },
}

impl LifecycleError {
    /// Returns `true` for errors caused by configuration rather than the
    /// provider or the guest.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoMatchingImage { .. }
                | Self::InvalidRegex { .. }
                | Self::Metadata(_)
                | Self::StaleInstance { .. }
        )
    }
}
