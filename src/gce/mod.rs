//! Compute Engine v1 REST client.
//!
//! [`GceClient`] implements [`ComputeApi`] with `reqwest` and bearer tokens
//! from a [`TokenSource`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

mod auth;
mod types;

pub use auth::{METADATA_TOKEN_URL, MetadataServerToken, StaticToken, TokenFuture, TokenSource};

use crate::provider::{
    ComputeApi, ImageRecord, InstanceRecord, InstanceRequest, OperationHandle, Placement,
    ProviderError, ProviderFuture,
};
use crate::retry::{Attempt, Clock, RetryError, RetryPolicy, poll_until};
use types::{ImageList, Instance, InstanceResource, Operation, Project, SerialPortOutput};

/// Production API root.
pub const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for obtaining the first access token.
pub const TOKEN_RETRY: RetryPolicy = RetryPolicy::new(Duration::from_secs(6), 10);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Compute Engine client.
#[derive(Clone)]
pub struct GceClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for GceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GceClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GceClient {
    /// Creates a client against the production endpoint.
    #[must_use]
    pub fn new(tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http: http_client(),
            base_url: COMPUTE_API_BASE.to_owned(),
            tokens,
        }
    }

    /// Points the client at another API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    /// Creates a client after confirming a token can be obtained, retrying
    /// per [`TOKEN_RETRY`].
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Auth`] carrying the last failure once the
    /// budget is spent.
    pub async fn connect(
        tokens: Arc<dyn TokenSource>,
        clock: &dyn Clock,
        base_url: Option<&str>,
    ) -> Result<Self, ProviderError> {
        let probe = Arc::clone(&tokens);
        poll_until(clock, TOKEN_RETRY, "credentials", |_| {
            let source = Arc::clone(&probe);
            async move {
                match source.token().await {
                    Ok(_) => Attempt::Ready(()),
                    Err(err) => Attempt::Pending(err),
                }
            }
        })
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { last, .. } | RetryError::Aborted(last) => last,
        })?;
        info!("compute API credentials acquired");

        let client = Self::new(tokens);
        Ok(match base_url {
            Some(url) => client.with_base_url(url),
            None => client,
        })
    }

    fn zone_url(&self, placement: &Placement, tail: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{tail}",
            self.base_url, placement.project, placement.zone
        )
    }

    async fn send(
        &self,
        builder: RequestBuilder,
    ) -> Result<(StatusCode, String), ProviderError> {
        let token = self.tokens.token().await?;
        let response = builder
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ProviderError::Transport {
                message: err.to_string(),
            })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport {
                message: err.to_string(),
            })?;
        Ok((status, body))
    }

    async fn expect_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        resource: &str,
    ) -> Result<T, ProviderError> {
        let (status, body) = self.send(builder).await?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        decode(&body, resource)
    }
}

fn decode<T: DeserializeOwned>(body: &str, resource: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|err| ProviderError::Decode {
        resource: resource.to_owned(),
        message: err.to_string(),
    })
}

impl ComputeApi for GceClient {
    fn list_images<'a>(&'a self, project: &'a str) -> ProviderFuture<'a, Vec<ImageRecord>> {
        Box::pin(async move {
            let url = format!("{}/projects/{project}/global/images", self.base_url);
            let mut images = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let mut builder = self.http.get(&url);
                if let Some(token) = page_token.as_deref() {
                    builder = builder.query(&[("pageToken", token)]);
                }
                let page: ImageList = self.expect_json(builder, "image list").await?;
                images.extend(page.items.into_iter().map(ImageRecord::from));
                match page.next_page_token.filter(|token| !token.is_empty()) {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }
            debug!(project, count = images.len(), "listed images");
            Ok(images)
        })
    }

    fn get_instance<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceRecord>> {
        Box::pin(async move {
            let url = self.zone_url(placement, &format!("instances/{name}"));
            let (status, body) = self.send(self.http.get(&url)).await?;
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    message: body,
                });
            }
            let instance: Instance = decode(&body, "instance")?;
            Ok(Some(InstanceRecord::from(instance)))
        })
    }

    fn insert_instance<'a>(
        &'a self,
        placement: &'a Placement,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, OperationHandle> {
        Box::pin(async move {
            let url = self.zone_url(placement, "instances");
            let payload = InstanceResource::from(request);
            let operation: Operation = self
                .expect_json(self.http.post(&url).json(&payload), "operation")
                .await?;
            Ok(OperationHandle::from(operation))
        })
    }

    fn get_operation<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, OperationHandle> {
        Box::pin(async move {
            let url = self.zone_url(placement, &format!("operations/{name}"));
            let operation: Operation = self.expect_json(self.http.get(&url), "operation").await?;
            Ok(OperationHandle::from(operation))
        })
    }

    fn serial_port_output<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
        port: u32,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let url = self.zone_url(placement, &format!("instances/{name}/serialPort"));
            let builder = self.http.get(&url).query(&[("port", port.to_string())]);
            let output: SerialPortOutput = self.expect_json(builder, "serial port output").await?;
            Ok(output.contents)
        })
    }

    fn delete_instance<'a>(
        &'a self,
        placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, OperationHandle> {
        Box::pin(async move {
            let url = self.zone_url(placement, &format!("instances/{name}"));
            let operation: Operation =
                self.expect_json(self.http.delete(&url), "operation").await?;
            Ok(OperationHandle::from(operation))
        })
    }

    fn default_service_account<'a>(&'a self, project: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let url = format!("{}/projects/{project}", self.base_url);
            let project_info: Project = self.expect_json(self.http.get(&url), "project").await?;
            if project_info.default_service_account.is_empty() {
                return Err(ProviderError::Decode {
                    resource: String::from("project"),
                    message: format!("project {project} has no default service account"),
                });
            }
            Ok(project_info.default_service_account)
        })
    }
}
