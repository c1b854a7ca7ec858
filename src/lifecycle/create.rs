//! Instance provisioning: submit an insert or adopt a matching instance.

use tracing::{info, warn};

use crate::provider::{ComputeApi, InstanceRecord, InstanceRequest, OperationHandle, Placement};

use super::LifecycleError;

/// Result of [`InstanceProvisioner::provision`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionOutcome {
    /// A new instance was submitted; the operation tracks its creation.
    Created(OperationHandle),
    /// An instance with the target name and machine type already existed.
    Adopted(InstanceRecord),
}

impl ProvisionOutcome {
    /// Creation operation to wait on, absent for adopted instances.
    #[must_use]
    pub const fn operation(&self) -> Option<&OperationHandle> {
        match self {
            Self::Created(handle) => Some(handle),
            Self::Adopted(_) => None,
        }
    }
}

/// Returns the trailing segment of a machine type path or URL.
#[must_use]
pub fn machine_type_name(machine_type: &str) -> &str {
    machine_type.rsplit('/').next().unwrap_or(machine_type)
}

/// Submits instance requests to the provider.
pub struct InstanceProvisioner<'a> {
    compute: &'a dyn ComputeApi,
    placement: &'a Placement,
}

impl<'a> InstanceProvisioner<'a> {
    /// Creates a provisioner for `placement`.
    #[must_use]
    pub const fn new(compute: &'a dyn ComputeApi, placement: &'a Placement) -> Self {
        Self { compute, placement }
    }

    /// Ensures an instance named after `request` exists.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StaleInstance`] when an instance with the
    /// same name runs a different machine type,
    /// [`LifecycleError::OperationFailed`] when the submission reports
    /// errors, and [`LifecycleError::Provider`] when the lookup or the
    /// submission fails.
    pub async fn provision(
        &self,
        request: &InstanceRequest,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        if let Some(existing) = self
            .compute
            .get_instance(self.placement, &request.name)
            .await?
        {
            let expected = machine_type_name(&request.machine_type);
            let actual = machine_type_name(&existing.machine_type);
            if expected != actual {
                warn!(
                    instance = %request.name,
                    expected,
                    actual,
                    "existing instance has a different machine type"
                );
                return Err(LifecycleError::StaleInstance {
                    instance: request.name.clone(),
                    expected: expected.to_owned(),
                    actual: actual.to_owned(),
                });
            }
            info!(
                instance = %request.name,
                status = %existing.status,
                "adopting existing instance"
            );
            return Ok(ProvisionOutcome::Adopted(existing));
        }

        let handle = self
            .compute
            .insert_instance(self.placement, request)
            .await?;
        if handle.has_errors() {
            return Err(LifecycleError::OperationFailed {
                instance: request.name.clone(),
                message: handle.error_summary(),
            });
        }
        info!(
            instance = %request.name,
            operation = %handle.name,
            machine_type = %request.machine_type,
            "instance creation submitted"
        );
        Ok(ProvisionOutcome::Created(handle))
    }
}
