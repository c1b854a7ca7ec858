//! Instance lifecycle stages for the GCE runner.
//!
//! Each stage is a small type borrowing the provider, remote executor and
//! clock it needs, so the orchestrator composes them per image and tests
//! drive them with in-memory doubles.

mod create;
mod error;
mod image;
mod kernel;
mod reboot;
mod spec;
mod teardown;
mod wait;

pub use create::{InstanceProvisioner, ProvisionOutcome, machine_type_name};
pub use error::LifecycleError;
pub use image::{ImageResolver, select_latest};
pub use kernel::{ImageFamily, KernelArgumentReconfigurer, KernelUpdate, kernel_update_command};
pub use reboot::{LIVENESS_PROBE, RebootCoordinator, RebootPolicy};
pub use spec::{
    BOOT_DISK_SIZE_GB, CLOUD_PLATFORM_SCOPE, DEFAULT_MACHINE_TYPE, InstanceSpecBuilder,
    ResolvedImage,
};
pub use teardown::LifecycleTeardown;
pub use wait::{
    CLOUD_INIT_PROBE, CONTAINER_RUNTIME_PROBE, ReadinessBudgets, ReadinessPoller,
    ReadinessStage, ReadyInstance, SSH_PROBE,
};

#[cfg(test)]
mod tests;
