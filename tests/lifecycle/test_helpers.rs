//! Shared fixtures for lifecycle BDD scenarios.

use std::collections::BTreeMap;

use node_e2e_runner::lifecycle::{LifecycleError, ReadinessStage, RebootPolicy};
use node_e2e_runner::provider::{InstanceRecord, InstanceStatus, Placement};
use node_e2e_runner::remote::HostRegistry;
use node_e2e_runner::test_support::{FakeClock, FakeCompute, ScriptedRemote};
use rstest::fixture;

pub const IMAGE_PROJECT: &str = "img-project";
pub const HOST: &str = "tmp-node-e2e-ab12cd34-img-b";

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub compute: FakeCompute,
    pub remote: ScriptedRemote,
    pub clock: FakeClock,
    pub registry: HostRegistry,
    pub placement: Placement,
    pub reboot: RebootPolicy,
    pub outcome: Option<LifecycleResult>,
}

#[derive(Clone, Debug)]
pub enum LifecycleResult {
    Resolved(String),
    Ready(Vec<ReadinessStage>),
    Rebooted,
    Failure(LifecycleError),
}

impl LifecycleContext {
    pub fn with_outcome(self, outcome: LifecycleResult) -> Self {
        Self {
            outcome: Some(outcome),
            ..self
        }
    }

    pub fn running_instance(&self) {
        self.compute.add_instance(InstanceRecord {
            name: String::from(HOST),
            status: InstanceStatus::new("RUNNING"),
            machine_type: String::from("zones/us-central1-f/machineTypes/e2-medium"),
            external_ip: Some(String::from("203.0.113.20")),
            metadata: BTreeMap::new(),
        });
    }
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    LifecycleContext {
        compute: FakeCompute::new(),
        remote: ScriptedRemote::healthy(),
        clock: FakeClock::new(),
        registry: HostRegistry::new(),
        placement: Placement::new("node-e2e", "us-central1-f"),
        reboot: RebootPolicy::default(),
        outcome: None,
    }
}
