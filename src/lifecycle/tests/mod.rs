//! Unit tests for lifecycle stages.

use std::collections::BTreeMap;

use crate::provider::{InstanceRecord, InstanceStatus, Placement};

use super::InstanceSpecBuilder;

const PROJECT: &str = "node-e2e-project";
const ZONE: &str = "us-central1-f";

fn placement() -> Placement {
    Placement::new(PROJECT, ZONE)
}

fn builder() -> InstanceSpecBuilder {
    InstanceSpecBuilder::new(placement(), "tmp-node-e2e-1a2b3c4d").instance_type("e2-medium")
}

fn instance(name: &str, machine_type: &str, status: &str) -> InstanceRecord {
    InstanceRecord {
        name: name.to_owned(),
        status: InstanceStatus::new(status),
        machine_type: machine_type.to_owned(),
        external_ip: Some(String::from("198.51.100.4")),
        metadata: BTreeMap::new(),
    }
}

mod wait;
