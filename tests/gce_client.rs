//! HTTP-level tests for the Compute Engine client against a mock server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use node_e2e_runner::gce::{GceClient, MetadataServerToken, StaticToken, TokenSource};
use node_e2e_runner::provider::{
    BootDisk, ComputeApi, GuestAccelerator, InstanceRequest, NetworkAccess, OperationStatus,
    Placement, ProviderError, Scheduling, ServiceAccount,
};
use node_e2e_runner::test_support::FakeClock;
use serde_json::json;
use wiremock::matchers::{
    body_partial_json, header, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ZONE_ROOT: &str = "/projects/node-e2e/zones/us-central1-f";

fn placement() -> Placement {
    Placement::new("node-e2e", "us-central1-f")
}

fn client(server: &MockServer) -> GceClient {
    GceClient::new(Arc::new(StaticToken::new("test-token"))).with_base_url(server.uri())
}

#[tokio::test]
async fn image_listing_follows_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects/cos-cloud/global/images"))
        .and(query_param_is_missing("pageToken"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "name": "cos-109-17800-66-27",
                "family": "cos-109-lts",
                "creationTimestamp": "2024-01-01T00:00:00.000-08:00"
            }],
            "nextPageToken": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects/cos-cloud/global/images"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "name": "cos-beta-113",
                "family": "",
                "creationTimestamp": "2024-02-01T00:00:00.000-08:00"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let images = client(&server)
        .list_images("cos-cloud")
        .await
        .expect("images listed");

    let names: Vec<&str> = images.iter().map(|image| image.name.as_str()).collect();
    assert_eq!(names, vec!["cos-109-17800-66-27", "cos-beta-113"]);
    assert_eq!(images.first().and_then(|image| image.family.as_deref()), Some("cos-109-lts"));
    assert_eq!(images.get(1).and_then(|image| image.family.as_deref()), None);
}

#[tokio::test]
async fn missing_instance_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{ZONE_ROOT}/instances/tmp-node-e2e-cos")))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;

    let instance = client(&server)
        .get_instance(&placement(), "tmp-node-e2e-cos")
        .await
        .expect("lookup succeeds");

    assert!(instance.is_none());
}

#[tokio::test]
async fn instance_exposes_status_and_external_ip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{ZONE_ROOT}/instances/tmp-node-e2e-cos")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "tmp-node-e2e-cos",
            "status": "RUNNING",
            "machineType": "https://www.googleapis.com/compute/v1/projects/node-e2e/zones/us-central1-f/machineTypes/e2-medium",
            "networkInterfaces": [{
                "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "natIP": "198.51.100.9"}]
            }],
            "metadata": {"items": [{"key": "user-data", "value": "#cloud-config\n"}]}
        })))
        .mount(&server)
        .await;

    let instance = client(&server)
        .get_instance(&placement(), "tmp-node-e2e-cos")
        .await
        .expect("lookup succeeds")
        .expect("instance exists");

    assert!(instance.status.is_running());
    assert_eq!(instance.external_ip.as_deref(), Some("198.51.100.9"));
    assert_eq!(
        instance.metadata.get("user-data").map(String::as_str),
        Some("#cloud-config\n")
    );
}

#[tokio::test]
async fn insert_sends_the_instance_resource() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{ZONE_ROOT}/instances")))
        .and(body_partial_json(json!({
            "name": "tmp-node-e2e-cos",
            "machineType": "zones/us-central1-f/machineTypes/n1-standard-4",
            "disks": [{
                "type": "PERSISTENT",
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": "projects/cos-cloud/global/images/cos-109",
                    "diskSizeGb": "20"
                }
            }],
            "guestAccelerators": [{
                "acceleratorType": "projects/node-e2e/zones/us-central1-f/acceleratorTypes/nvidia-tesla-t4",
                "acceleratorCount": 1
            }],
            "scheduling": {
                "preemptible": false,
                "onHostMaintenance": "TERMINATE",
                "automaticRestart": true
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-123",
            "status": "RUNNING"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let request = InstanceRequest {
        name: String::from("tmp-node-e2e-cos"),
        machine_type: String::from("zones/us-central1-f/machineTypes/n1-standard-4"),
        boot_disk: BootDisk {
            source_image: String::from("projects/cos-cloud/global/images/cos-109"),
            size_gb: 20,
            auto_delete: true,
        },
        network: NetworkAccess {
            access_type: String::from("ONE_TO_ONE_NAT"),
            name: String::from("External NAT"),
        },
        service_account: ServiceAccount {
            email: String::from("1234-compute@developer.gserviceaccount.com"),
            scopes: vec![String::from("https://www.googleapis.com/auth/cloud-platform")],
        },
        metadata: BTreeMap::from([(String::from("cos-update-strategy"), String::from("update_disabled"))]),
        accelerators: vec![GuestAccelerator {
            accelerator_type: String::from(
                "projects/node-e2e/zones/us-central1-f/acceleratorTypes/nvidia-tesla-t4",
            ),
            count: 1,
        }],
        scheduling: Scheduling {
            preemptible: false,
            on_host_maintenance: Some(String::from("TERMINATE")),
            automatic_restart: Some(true),
        },
    };

    let operation = client(&server)
        .insert_instance(&placement(), &request)
        .await
        .expect("insert accepted");

    assert_eq!(operation.name, "operation-123");
    assert_eq!(operation.status, OperationStatus::Running);
    assert!(!operation.has_errors());
}

#[tokio::test]
async fn operation_errors_are_decoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{ZONE_ROOT}/operations/operation-123")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-123",
            "status": "DONE",
            "error": {"errors": [
                {"code": "QUOTA_EXCEEDED", "message": "CPUS quota exceeded"},
                {"code": "ZONE_RESOURCE_POOL_EXHAUSTED", "message": "try later"}
            ]}
        })))
        .mount(&server)
        .await;

    let operation = client(&server)
        .get_operation(&placement(), "operation-123")
        .await
        .expect("operation fetched");

    assert!(operation.is_done());
    assert_eq!(
        operation.error_summary(),
        "QUOTA_EXCEEDED: CPUS quota exceeded; ZONE_RESOURCE_POOL_EXHAUSTED: try later"
    );
}

#[tokio::test]
async fn api_failures_carry_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{ZONE_ROOT}/instances/tmp-node-e2e-cos")))
        .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
        .mount(&server)
        .await;

    let err = client(&server)
        .delete_instance(&placement(), "tmp-node-e2e-cos")
        .await
        .expect_err("delete forbidden");

    assert_eq!(
        err,
        ProviderError::Api {
            status: 403,
            message: String::from("permission denied"),
        }
    );
}

#[tokio::test]
async fn serial_output_requests_the_port() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{ZONE_ROOT}/instances/tmp-node-e2e-cos/serialPort")))
        .and(query_param("port", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"contents": "Booting kernel\n"})),
        )
        .mount(&server)
        .await;

    let contents = client(&server)
        .serial_port_output(&placement(), "tmp-node-e2e-cos", 1)
        .await
        .expect("serial output fetched");

    assert_eq!(contents, "Booting kernel\n");
}

#[tokio::test]
async fn default_service_account_comes_from_the_project() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects/node-e2e"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "node-e2e",
            "defaultServiceAccount": "1234-compute@developer.gserviceaccount.com"
        })))
        .mount(&server)
        .await;

    let account = client(&server)
        .default_service_account("node-e2e")
        .await
        .expect("service account found");

    assert_eq!(account, "1234-compute@developer.gserviceaccount.com");
}

#[tokio::test]
async fn metadata_server_tokens_are_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.cached",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let source = MetadataServerToken::new(format!("{}/token", server.uri()));

    let first = source.token().await.expect("token fetched");
    let second = source.token().await.expect("token cached");

    assert_eq!(first, "ya29.cached");
    assert_eq!(second, "ya29.cached");
}

#[tokio::test]
async fn connect_gives_up_after_the_token_budget() {
    let clock = FakeClock::new();

    let err = GceClient::connect(Arc::new(StaticToken::new(" ")), &clock, None)
        .await
        .expect_err("blank token never works");

    assert!(matches!(err, ProviderError::Auth { .. }));
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(6); 9]);
}
