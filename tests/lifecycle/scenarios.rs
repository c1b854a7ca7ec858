//! BDD scenarios for the instance lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Select the newest image matching a name pattern"
)]
fn scenario_newest_image(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Fail when no image belongs to the family"
)]
fn scenario_empty_family(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Advance past SSH after transient failures"
)]
fn scenario_ssh_retry(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Report a host that never went down during reboot"
)]
fn scenario_reboot_never_down(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
