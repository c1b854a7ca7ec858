//! Runner configuration loading via `ortho-config`.
//!
//! [`RunnerConfig`] merges defaults, the discovered `node-e2e.toml` and
//! `NODE_E2E_*` environment variables. It is loaded once per invocation and
//! treated as immutable afterwards.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::metadata::{Metadata, MetadataDecoder, MetadataError, PublicKeyInjection};
use crate::provider::Placement;

/// Instance type used when none is configured.
pub const DEFAULT_INSTANCE_TYPE: &str = "e2-medium";

/// Prefix of generated instance name prefixes.
pub const DEFAULT_NAME_PREFIX_STEM: &str = "tmp-node-e2e-";

/// Settings shared by every image of a run.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODE_E2E",
    discovery(
        app_name = "node-e2e",
        env_var = "NODE_E2E_CONFIG_PATH",
        config_file_name = "node-e2e.toml",
        dotfile_name = ".node-e2e.toml",
        project_file_name = "node-e2e.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggle settings that are naturally expressed as booleans"
)]
pub struct RunnerConfig {
    /// Project instances are launched into.
    #[ortho_config(default = String::new())]
    pub project: String,
    /// Zone instances are launched into.
    #[ortho_config(default = String::new())]
    pub zone: String,
    /// Project hosting images passed by bare name.
    pub image_project: Option<String>,
    /// Machine type used when an image has no override.
    #[ortho_config(default = DEFAULT_INSTANCE_TYPE.to_owned())]
    pub instance_type: String,
    /// Whether instances are created preemptible.
    #[ortho_config(default = false)]
    pub preemptible_instances: bool,
    /// Metadata applied to every instance, in `key=value,key<path` form.
    pub instance_metadata: Option<String>,
    /// Prefix for instance names; a random one is generated when unset.
    pub instance_name_prefix: Option<String>,
    /// Image configuration document.
    pub image_config_file: Option<String>,
    /// Directory the image configuration file and metadata paths are
    /// relative to.
    pub image_config_dir: Option<String>,
    /// Comma-separated bare image names.
    pub images: Option<String>,
    /// Comma-separated `KEY=VALUE` node environment overrides.
    pub node_env: Option<String>,
    /// Whether instances are deleted after the run.
    #[ortho_config(default = true)]
    pub delete_instances: bool,
    /// Whether test artefacts are removed from kept instances.
    #[ortho_config(default = true)]
    pub cleanup: bool,
    /// Whether the SSH public key is injected into file-sourced metadata.
    #[ortho_config(default = false)]
    pub inject_ssh_public_key: bool,
    /// Public key injected when injection is enabled.
    pub ssh_public_key_file: Option<String>,
    /// Directory receiving per-host artefacts such as serial logs.
    #[ortho_config(default = "_artifacts".to_owned())]
    pub artifacts_dir: String,
    /// OAuth access token; the metadata server is queried when unset.
    pub access_token: Option<String>,
    /// Compute API root override.
    pub compute_api_base: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

const PROJECT: FieldMetadata = FieldMetadata::new("GCE project", "NODE_E2E_PROJECT", "project");
const ZONE: FieldMetadata = FieldMetadata::new("GCE zone", "NODE_E2E_ZONE", "zone");
const PUBLIC_KEY: FieldMetadata = FieldMetadata::new(
    "SSH public key file",
    "NODE_E2E_SSH_PUBLIC_KEY_FILE",
    "ssh_public_key_file",
);

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

impl RunnerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to node-e2e.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("node-e2e-runner")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation for a run over `image_count` images.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the project is empty, when
    /// the zone is empty while images are configured, or when key injection
    /// is enabled without a key file.
    pub fn validate(&self, image_count: usize) -> Result<(), ConfigError> {
        Self::require_field(&self.project, &PROJECT)?;
        if image_count > 0 {
            Self::require_field(&self.zone, &ZONE)?;
        }
        if self.inject_ssh_public_key {
            Self::require_field(
                self.ssh_public_key_file.as_deref().unwrap_or_default(),
                &PUBLIC_KEY,
            )?;
        }
        Ok(())
    }

    /// Project and zone of the run.
    #[must_use]
    pub fn placement(&self) -> Placement {
        Placement::new(self.project.trim(), self.zone.trim())
    }

    /// Bare image names from [`RunnerConfig::images`].
    #[must_use]
    pub fn image_list(&self) -> Vec<String> {
        split_list(self.images.as_deref())
    }

    /// Configured name prefix, or a fresh `tmp-node-e2e-<8 hex>` one.
    #[must_use]
    pub fn resolved_name_prefix(&self) -> String {
        match self.instance_name_prefix.as_deref().map(str::trim) {
            Some(prefix) if !prefix.is_empty() => prefix.to_owned(),
            _ => {
                let id = Uuid::new_v4().simple().to_string();
                let short: String = id.chars().take(8).collect();
                format!("{DEFAULT_NAME_PREFIX_STEM}{short}")
            }
        }
    }

    /// Location of the image configuration document, joined with the config
    /// directory when one is set.
    #[must_use]
    pub fn image_config_path(&self) -> Option<Utf8PathBuf> {
        let file = self.image_config_file.as_deref()?.trim();
        if file.is_empty() {
            return None;
        }
        match self.image_config_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Some(Utf8PathBuf::from(dir).join(file)),
            _ => Some(Utf8PathBuf::from(file)),
        }
    }

    /// Builds the metadata decoder for this run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Metadata`] when the public key cannot be read.
    pub fn metadata_decoder(&self) -> Result<MetadataDecoder, ConfigError> {
        let mut decoder = MetadataDecoder::new();
        if let Some(dir) = self.image_config_dir.as_deref().map(str::trim)
            && !dir.is_empty()
        {
            decoder = decoder.with_base_dir(dir);
        }
        if self.inject_ssh_public_key
            && let Some(path) = self.ssh_public_key_file.as_deref()
        {
            decoder = decoder.with_key_injection(PublicKeyInjection::from_file(path)?);
        }
        Ok(decoder)
    }

    /// Parsed node environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Metadata`] for malformed entries.
    pub fn node_envs(&self) -> Result<Metadata, ConfigError> {
        Ok(crate::metadata::parse_node_envs(
            self.node_env.as_deref().unwrap_or_default(),
        )?)
    }

    /// Whether test executors should clean up remote artefacts.
    #[must_use]
    pub const fn cleanup_after_tests(&self) -> bool {
        !self.delete_instances && self.cleanup
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when configured metadata cannot be prepared.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

