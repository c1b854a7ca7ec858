//! BDD step definitions for the instance lifecycle.

use std::sync::Arc;
use std::time::Duration;

use node_e2e_runner::lifecycle::{
    ImageResolver, LifecycleError, ReadinessPoller, ReadinessStage, RebootCoordinator,
};
use node_e2e_runner::metadata::Metadata;
use node_e2e_runner::retry::RetryPolicy;
use node_e2e_runner::test_support::remote_failure;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{HOST, IMAGE_PROJECT, LifecycleContext, LifecycleResult};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("failed to start runtime: {0}")]
    Runtime(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Runtime(err.to_string()))
}

fn outcome(lifecycle_context: &LifecycleContext) -> Result<&LifecycleResult, StepError> {
    lifecycle_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

fn resolve(
    lifecycle_context: LifecycleContext,
    regex: Option<&str>,
    family: Option<&str>,
) -> Result<LifecycleContext, StepError> {
    let resolver = ImageResolver::new(Arc::new(lifecycle_context.compute.clone()));
    let result = runtime()?.block_on(resolver.resolve(regex, family, IMAGE_PROJECT));
    let outcome = match result {
        Ok(image) => LifecycleResult::Resolved(image),
        Err(err) => LifecycleResult::Failure(err),
    };
    Ok(lifecycle_context.with_outcome(outcome))
}

#[given("image \"{name}\" created at \"{created}\"")]
fn image_created_at(
    lifecycle_context: LifecycleContext,
    name: String,
    created: String,
) -> LifecycleContext {
    lifecycle_context
        .compute
        .add_image(IMAGE_PROJECT, &name, None, &created);
    lifecycle_context
}

#[given("a running instance")]
fn running_instance(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.running_instance();
    lifecycle_context
}

#[given("SSH fails \"{failures}\" times before answering")]
fn ssh_fails_before_answering(
    lifecycle_context: LifecycleContext,
    failures: usize,
) -> LifecycleContext {
    let responses = (0..failures)
        .map(|_| Err(remote_failure(HOST, "Connection refused")))
        .chain([Ok(String::from("6.1.58+\n"))]);
    lifecycle_context.remote.respond("uname", responses);
    lifecycle_context
}

#[given("the host keeps answering liveness checks")]
fn host_keeps_answering(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
        .remote
        .succeed("date", "Mon Jan  1 00:00:00 UTC 2024\n");
    lifecycle_context
}

#[given("a reboot budget of \"{attempts}\" attempts")]
fn reboot_budget(mut lifecycle_context: LifecycleContext, attempts: u32) -> LifecycleContext {
    lifecycle_context.reboot.down = RetryPolicy::new(Duration::from_secs(5), attempts);
    lifecycle_context
}

#[when("I resolve the latest image matching \"{regex}\"")]
fn resolve_by_regex(
    lifecycle_context: LifecycleContext,
    regex: String,
) -> Result<LifecycleContext, StepError> {
    resolve(lifecycle_context, Some(regex.as_str()), None)
}

#[when("I resolve the latest image in family \"{family}\"")]
fn resolve_by_family(
    lifecycle_context: LifecycleContext,
    family: String,
) -> Result<LifecycleContext, StepError> {
    resolve(lifecycle_context, None, Some(family.as_str()))
}

#[when("I wait for the instance to become ready")]
fn wait_for_ready(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let poller = ReadinessPoller::new(
        &lifecycle_context.compute,
        &lifecycle_context.remote,
        &lifecycle_context.registry,
        &lifecycle_context.clock,
        &lifecycle_context.placement,
    );
    let result = runtime()?.block_on(poller.wait_ready(HOST, None, &Metadata::new()));
    let outcome = match result {
        Ok(ready) => LifecycleResult::Ready(ready.stages),
        Err(err) => LifecycleResult::Failure(err),
    };
    Ok(lifecycle_context.with_outcome(outcome))
}

#[when("I reboot the instance")]
fn reboot_instance(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let coordinator = RebootCoordinator::new(&lifecycle_context.remote, &lifecycle_context.clock)
        .with_policy(lifecycle_context.reboot);
    let result = runtime()?.block_on(coordinator.reboot(HOST));
    let outcome = match result {
        Ok(()) => LifecycleResult::Rebooted,
        Err(err) => LifecycleResult::Failure(err),
    };
    Ok(lifecycle_context.with_outcome(outcome))
}

#[then("the resolved image is \"{expected}\"")]
fn resolved_image_is(
    lifecycle_context: &LifecycleContext,
    expected: String,
) -> Result<(), StepError> {
    match outcome(lifecycle_context)? {
        LifecycleResult::Resolved(image) if *image == expected => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {expected}, got {other:?}"
        ))),
    }
}

#[then("resolution fails because no image matched")]
fn resolution_found_nothing(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match outcome(lifecycle_context)? {
        LifecycleResult::Failure(LifecycleError::NoMatchingImage { family, .. })
            if family == "nonexistent" =>
        {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected a missing image error, got {other:?}"
        ))),
    }
}

#[then("the instance passes the container runtime check")]
fn container_runtime_reached(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let expected = [
        ReadinessStage::InstanceRunning,
        ReadinessStage::SshReachable,
        ReadinessStage::ContainerRuntimePresent,
    ];
    match outcome(lifecycle_context)? {
        LifecycleResult::Ready(stages) if stages.as_slice() == expected.as_slice() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected stages {expected:?}, got {other:?}"
        ))),
    }
}

#[then("SSH was attempted \"{attempts}\" times")]
fn ssh_attempts(lifecycle_context: &LifecycleContext, attempts: usize) -> Result<(), StepError> {
    let actual = lifecycle_context.remote.count("uname -r");
    if actual == attempts {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {attempts} SSH attempts, got {actual}"
        )))
    }
}

#[then("the reboot fails because the host never went down after \"{attempts}\" attempts")]
fn reboot_never_went_down(
    lifecycle_context: &LifecycleContext,
    attempts: u32,
) -> Result<(), StepError> {
    match outcome(lifecycle_context)? {
        LifecycleResult::Failure(LifecycleError::NeverWentDown {
            instance,
            attempts: spent,
        }) if instance == HOST && *spent == attempts => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected the host to never go down, got {other:?}"
        ))),
    }
}
