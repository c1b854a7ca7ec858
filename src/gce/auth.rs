//! Access token sources for the Compute API.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::ProviderError;

/// Future returned by [`TokenSource::token`].
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>>;

/// Default metadata server token endpoint.
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Tokens are refreshed this long before the server-side expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Supplies bearer tokens for API requests.
pub trait TokenSource: Send + Sync {
    /// Returns a currently valid access token.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Auth`] when no token can be obtained.
    fn token(&self) -> TokenFuture<'_>;
}

/// Fixed token supplied by the caller.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            if self.0.trim().is_empty() {
                return Err(ProviderError::Auth {
                    message: String::from("access token is empty"),
                });
            }
            Ok(self.0.clone())
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Token fetched from the GCE metadata server and cached until near expiry.
pub struct MetadataServerToken {
    http: reqwest::Client,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for MetadataServerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataServerToken")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl Default for MetadataServerToken {
    fn default() -> Self {
        Self::new(METADATA_TOKEN_URL)
    }
}

impl MetadataServerToken {
    /// Creates a source reading from `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: super::http_client(),
            url: url.into(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<TokenResponse, ProviderError> {
        let auth_error = |message: String| ProviderError::Auth { message };
        let response = self
            .http
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| auth_error(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| auth_error(err.to_string()))?;
        if !status.is_success() {
            return Err(auth_error(format!(
                "metadata server answered {}: {body}",
                status.as_u16()
            )));
        }
        serde_json::from_str(&body).map_err(|err| auth_error(err.to_string()))
    }
}

impl TokenSource for MetadataServerToken {
    fn token(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            let mut cached = self.cached.lock().await;
            if let Some(token) = cached.as_ref()
                && Instant::now() < token.refresh_at
            {
                return Ok(token.value.clone());
            }

            let response = self.fetch().await?;
            let lifetime = Duration::from_secs(response.expires_in).saturating_sub(EXPIRY_MARGIN);
            debug!(lifetime_secs = lifetime.as_secs(), "refreshed access token");
            let value = response.access_token;
            *cached = Some(CachedToken {
                value: value.clone(),
                refresh_at: Instant::now() + lifetime,
            });
            Ok(value)
        })
    }
}
