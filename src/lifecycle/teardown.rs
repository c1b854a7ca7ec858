//! Best-effort instance deletion.

use tracing::{error, info};

use crate::provider::{ComputeApi, Placement};

/// Deletes instances without surfacing failures to the caller.
pub struct LifecycleTeardown<'a> {
    compute: &'a dyn ComputeApi,
    placement: &'a Placement,
}

impl<'a> LifecycleTeardown<'a> {
    /// Creates a teardown helper for `placement`.
    #[must_use]
    pub const fn new(compute: &'a dyn ComputeApi, placement: &'a Placement) -> Self {
        Self { compute, placement }
    }

    /// Requests deletion of `name`. Completion is not awaited; errors are
    /// logged and swallowed.
    pub async fn delete(&self, name: &str) {
        info!(instance = name, "deleting instance");
        match self.compute.delete_instance(self.placement, name).await {
            Ok(handle) => info!(
                instance = name,
                operation = %handle.name,
                "instance deletion requested"
            ),
            Err(err) => error!(instance = name, error = %err, "error deleting instance"),
        }
    }
}
