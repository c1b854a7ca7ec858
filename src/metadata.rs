//! Instance metadata decoding.
//!
//! Metadata is written as comma-separated entries. Each entry is either
//! `key=value` or `key<path`, where the value of the latter is the content of
//! the file at `path`. Whichever of `=` and `<` appears first decides the
//! form, so values may themselves contain either character.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::util::{expand_tilde, read_to_string_ambient};

/// Decoded metadata; keys are unique and ordered.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key carrying cloud-init user data.
pub const USER_DATA_KEY: &str = "user-data";

/// Marker replaced by the public key during SSH key injection.
pub const PUBLIC_KEY_MARKER: &str = "GCE_SSH_PUBLIC_KEY_FILE_CONTENT";

/// Errors raised while decoding metadata.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// Raised when an entry is neither `key=value` nor `key<path`.
    #[error("invalid metadata entry `{entry}`: expected key=value or key<path")]
    InvalidEntry {
        /// Offending entry.
        entry: String,
    },
    /// Raised when a file-sourced value cannot be read.
    #[error("failed to read metadata `{key}` from `{path}`: {message}")]
    FileRead {
        /// Metadata key being populated.
        key: String,
        /// Resolved file path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the SSH public key for injection cannot be read.
    #[error("failed to read SSH public key `{path}`: {message}")]
    PublicKey {
        /// Public key path.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Replaces the public key marker in file-sourced metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicKeyInjection {
    key_base64: String,
}

impl PublicKeyInjection {
    /// Builds an injection from raw public key contents.
    #[must_use]
    pub fn from_key(contents: &str) -> Self {
        Self {
            key_base64: STANDARD.encode(contents),
        }
    }

    /// Reads the public key from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::PublicKey`] when the file cannot be read.
    pub fn from_file(path: &str) -> Result<Self, MetadataError> {
        let expanded = expand_tilde(path);
        let contents = read_to_string_ambient(Utf8Path::new(&expanded)).map_err(|message| {
            MetadataError::PublicKey {
                path: expanded.clone(),
                message,
            }
        })?;
        Ok(Self::from_key(&contents))
    }

    /// Replaces every occurrence of the marker, plain or base64-encoded.
    #[must_use]
    pub fn apply(&self, content: &str) -> String {
        let encoded_marker = STANDARD.encode(PUBLIC_KEY_MARKER);
        content
            .replace(&encoded_marker, &self.key_base64)
            .replace(PUBLIC_KEY_MARKER, &self.key_base64)
    }
}

/// Decodes metadata strings, resolving file references.
#[derive(Clone, Debug, Default)]
pub struct MetadataDecoder {
    base_dir: Option<Utf8PathBuf>,
    injection: Option<PublicKeyInjection>,
}

impl MetadataDecoder {
    /// Creates a decoder resolving relative paths against the working
    /// directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves relative file references against `dir`.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Enables SSH public key injection into file-sourced values.
    #[must_use]
    pub fn with_key_injection(mut self, injection: PublicKeyInjection) -> Self {
        self.injection = Some(injection);
        self
    }

    /// Decodes `raw`; later entries overwrite earlier ones with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::InvalidEntry`] for malformed entries and
    /// [`MetadataError::FileRead`] when a referenced file cannot be read.
    pub fn decode(&self, raw: &str) -> Result<Metadata, MetadataError> {
        let mut metadata = Metadata::new();
        for entry in raw.split(',') {
            if entry.is_empty() {
                continue;
            }
            let (key, value) = self.decode_entry(entry)?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }

    fn decode_entry(&self, entry: &str) -> Result<(String, String), MetadataError> {
        let invalid = || MetadataError::InvalidEntry {
            entry: entry.to_owned(),
        };
        let split_at = entry.find(['=', '<']).ok_or_else(invalid)?;
        let (key, rest) = entry.split_at(split_at);
        if key.is_empty() {
            return Err(invalid());
        }
        let mut chars = rest.chars();
        let separator = chars.next().ok_or_else(invalid)?;
        let value = chars.as_str();
        if separator == '=' {
            return Ok((key.to_owned(), value.to_owned()));
        }
        if value.is_empty() {
            return Err(invalid());
        }
        let path = self.resolve(value);
        let content =
            read_to_string_ambient(&path).map_err(|message| MetadataError::FileRead {
                key: key.to_owned(),
                path: path.to_string(),
                message,
            })?;
        let injected = match &self.injection {
            Some(injection) => {
                info!(key, path = %path, "injecting SSH public key into metadata");
                injection.apply(&content)
            }
            None => content,
        };
        Ok((key.to_owned(), injected))
    }

    fn resolve(&self, value: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from(expand_tilde(value));
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

/// Merges metadata layers; later layers win on key collisions.
#[must_use]
pub fn merge<'a>(layers: impl IntoIterator<Item = &'a Metadata>) -> Metadata {
    let mut merged = Metadata::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Parses a comma-separated `KEY=VALUE` node environment list.
///
/// # Errors
///
/// Returns [`MetadataError::InvalidEntry`] for entries without `=`.
pub fn parse_node_envs(raw: &str) -> Result<Metadata, MetadataError> {
    let mut envs = Metadata::new();
    for entry in raw.split(',').map(str::trim) {
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .filter(|(key, _)| !key.is_empty())
            .ok_or_else(|| MetadataError::InvalidEntry {
                entry: entry.to_owned(),
            })?;
        envs.insert(key.to_owned(), value.to_owned());
    }
    Ok(envs)
}

/// Returns `true` when `user-data` carries a cloud-config document.
#[must_use]
pub fn uses_cloud_init(metadata: &Metadata) -> bool {
    metadata
        .get(USER_DATA_KEY)
        .is_some_and(|value| value.starts_with("#cloud-config"))
}
