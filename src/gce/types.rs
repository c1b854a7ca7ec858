//! Wire representations of the Compute Engine v1 resources in use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provider::{
    ImageRecord, InstanceRecord, InstanceRequest, InstanceStatus, OperationError,
    OperationHandle, OperationStatus,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct ImageList {
    pub(super) items: Vec<Image>,
    pub(super) next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct Image {
    name: String,
    family: Option<String>,
    creation_timestamp: String,
}

impl From<Image> for ImageRecord {
    fn from(image: Image) -> Self {
        Self {
            name: image.name,
            family: image.family.filter(|family| !family.is_empty()),
            creation_timestamp: image.creation_timestamp,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
struct MetadataItem {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct Metadata {
    items: Vec<MetadataItem>,
}

impl Metadata {
    fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self {
            items: map
                .iter()
                .map(|(key, value)| MetadataItem {
                    key: key.clone(),
                    value: Some(value.clone()),
                })
                .collect(),
        }
    }

    fn into_map(self) -> BTreeMap<String, String> {
        self.items
            .into_iter()
            .map(|item| (item.key, item.value.unwrap_or_default()))
            .collect()
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
struct AccessConfig {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    access_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "natIP", skip_serializing_if = "Option::is_none")]
    nat_ip: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
struct NetworkInterface {
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct Instance {
    name: String,
    status: String,
    machine_type: String,
    network_interfaces: Vec<NetworkInterface>,
    metadata: Metadata,
}

impl From<Instance> for InstanceRecord {
    fn from(instance: Instance) -> Self {
        let external_ip = instance
            .network_interfaces
            .iter()
            .flat_map(|interface| interface.access_configs.iter())
            .find_map(|config| config.nat_ip.clone().filter(|ip| !ip.is_empty()));
        Self {
            name: instance.name,
            status: InstanceStatus::new(instance.status),
            machine_type: instance.machine_type,
            external_ip,
            metadata: instance.metadata.into_map(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OperationErrors {
    errors: Vec<OperationErrorEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OperationErrorEntry {
    code: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct Operation {
    name: String,
    status: String,
    error: Option<OperationErrors>,
}

impl From<Operation> for OperationHandle {
    fn from(operation: Operation) -> Self {
        let errors = operation
            .error
            .map(|error| {
                error
                    .errors
                    .into_iter()
                    .map(|entry| OperationError {
                        code: entry.code,
                        message: entry.message,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: operation.name,
            status: OperationStatus::parse(&operation.status),
            errors,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct SerialPortOutput {
    pub(super) contents: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct Project {
    pub(super) default_service_account: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams<'a> {
    source_image: &'a str,
    disk_size_gb: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachedDisk<'a> {
    #[serde(rename = "type")]
    disk_type: &'static str,
    boot: bool,
    auto_delete: bool,
    initialize_params: InitializeParams<'a>,
}

#[derive(Debug, Serialize)]
struct ServiceAccount<'a> {
    email: &'a str,
    scopes: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceleratorConfig<'a> {
    accelerator_type: &'a str,
    accelerator_count: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Scheduling<'a> {
    preemptible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_host_maintenance: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    automatic_restart: Option<bool>,
}

/// Insert payload derived from an [`InstanceRequest`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InstanceResource<'a> {
    name: &'a str,
    machine_type: &'a str,
    disks: Vec<AttachedDisk<'a>>,
    network_interfaces: Vec<NetworkInterface>,
    service_accounts: Vec<ServiceAccount<'a>>,
    metadata: Metadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    guest_accelerators: Vec<AcceleratorConfig<'a>>,
    scheduling: Scheduling<'a>,
}

impl<'a> From<&'a InstanceRequest> for InstanceResource<'a> {
    fn from(request: &'a InstanceRequest) -> Self {
        Self {
            name: &request.name,
            machine_type: &request.machine_type,
            disks: vec![AttachedDisk {
                disk_type: "PERSISTENT",
                boot: true,
                auto_delete: request.boot_disk.auto_delete,
                initialize_params: InitializeParams {
                    source_image: &request.boot_disk.source_image,
                    disk_size_gb: request.boot_disk.size_gb.to_string(),
                },
            }],
            network_interfaces: vec![NetworkInterface {
                access_configs: vec![AccessConfig {
                    access_type: Some(request.network.access_type.clone()),
                    name: Some(request.network.name.clone()),
                    nat_ip: None,
                }],
            }],
            service_accounts: vec![ServiceAccount {
                email: &request.service_account.email,
                scopes: &request.service_account.scopes,
            }],
            metadata: Metadata::from_map(&request.metadata),
            guest_accelerators: request
                .accelerators
                .iter()
                .map(|accelerator| AcceleratorConfig {
                    accelerator_type: &accelerator.accelerator_type,
                    accelerator_count: accelerator.count,
                })
                .collect(),
            scheduling: Scheduling {
                preemptible: request.scheduling.preemptible,
                on_host_maintenance: request.scheduling.on_host_maintenance.as_deref(),
                automatic_restart: request.scheduling.automatic_restart,
            },
        }
    }
}
