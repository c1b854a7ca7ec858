//! Image configuration documents and the image specs derived from them.
//!
//! The document is YAML (JSON is accepted as a YAML subset):
//!
//! ```yaml
//! images:
//!   cos-stable:
//!     image_regex: cos-stable-\d+
//!     project: cos-cloud
//!     metadata: "user-data<cos-init.yaml"
//!   ubuntu-gpu:
//!     image_family: ubuntu-2204-lts
//!     project: ubuntu-os-cloud
//!     machine: n1-standard-4
//!     resources:
//!       accelerators:
//!         - type: nvidia-tesla-t4
//!           count: 1
//! ```

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;

use crate::util::read_to_string_ambient;

/// Errors raised while loading image configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ImageConfigError {
    /// Raised when the document cannot be read.
    #[error("failed to read image config `{path}`: {message}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the document is not valid YAML or has the wrong shape.
    #[error("failed to parse image config `{path}`: {message}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when an entry names neither an image nor a selector.
    #[error("image `{short_name}` must set image, image_regex or image_family")]
    MissingImage {
        /// Short name of the entry.
        short_name: String,
    },
    /// Raised when an entry has no project.
    #[error("image `{short_name}` must set project")]
    MissingProject {
        /// Short name of the entry.
        short_name: String,
    },
    /// Raised when bare image names are given without an image project.
    #[error("--images requires an image project: set NODE_E2E_IMAGE_PROJECT or image_project")]
    MissingImageProject,
}

/// Top-level image configuration document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ImageConfigFile {
    /// Image entries keyed by short name.
    #[serde(default)]
    pub images: BTreeMap<String, ImageEntry>,
}

/// A single image entry as written in the document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImageEntry {
    /// Concrete image name.
    pub image: String,
    /// Regular expression selecting the newest matching image.
    pub image_regex: String,
    /// Family selecting the newest image in it.
    pub image_family: String,
    /// Description used in reports.
    pub image_description: String,
    /// Kernel arguments to append before testing.
    pub kernel_arguments: Vec<String>,
    /// Project hosting the image.
    pub project: String,
    /// Raw metadata string.
    pub metadata: String,
    /// Machine type override.
    pub machine: String,
    /// Additional resources.
    pub resources: Resources,
}

/// Additional resources attached to instances.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Resources {
    /// Guest accelerators.
    pub accelerators: Vec<Accelerator>,
}

/// Guest accelerator request.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Accelerator {
    /// Short accelerator type, for example `nvidia-tesla-t4`.
    #[serde(rename = "type")]
    pub accelerator_type: String,
    /// Number of devices.
    pub count: u32,
}

/// How the concrete image of a spec is found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageSource {
    /// A concrete image name.
    Named(String),
    /// The newest image matching the selectors.
    Latest {
        /// Name regex, when given.
        regex: Option<String>,
        /// Image family, when given.
        family: Option<String>,
    },
}

/// One image to test on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageSpec {
    /// Unique key of the image in the run.
    pub short_name: String,
    /// Image selection.
    pub source: ImageSource,
    /// Project hosting the image.
    pub project: String,
    /// Description; the image name is used when absent.
    pub description: Option<String>,
    /// Kernel arguments, in order.
    pub kernel_arguments: Vec<String>,
    /// Raw image-level metadata.
    pub metadata: String,
    /// Machine type override.
    pub machine: Option<String>,
    /// Guest accelerators.
    pub accelerators: Vec<Accelerator>,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

impl ImageSpec {
    /// Builds a spec from a document entry.
    ///
    /// # Errors
    ///
    /// Returns [`ImageConfigError::MissingProject`] or
    /// [`ImageConfigError::MissingImage`] for incomplete entries.
    pub fn from_entry(short_name: &str, entry: &ImageEntry) -> Result<Self, ImageConfigError> {
        let project = non_empty(&entry.project).ok_or_else(|| ImageConfigError::MissingProject {
            short_name: short_name.to_owned(),
        })?;
        let regex = non_empty(&entry.image_regex);
        let family = non_empty(&entry.image_family);
        let source = match non_empty(&entry.image) {
            Some(image) => ImageSource::Named(image),
            None if regex.is_some() || family.is_some() => ImageSource::Latest { regex, family },
            None => {
                return Err(ImageConfigError::MissingImage {
                    short_name: short_name.to_owned(),
                });
            }
        };
        Ok(Self {
            short_name: short_name.to_owned(),
            source,
            project,
            description: non_empty(&entry.image_description),
            kernel_arguments: entry.kernel_arguments.clone(),
            metadata: entry.metadata.clone(),
            machine: non_empty(&entry.machine),
            accelerators: entry.resources.accelerators.clone(),
        })
    }

    /// Builds a spec for a bare image name given on the command line.
    #[must_use]
    pub fn named(image: &str, project: &str) -> Self {
        Self {
            short_name: image.to_owned(),
            source: ImageSource::Named(image.to_owned()),
            project: project.to_owned(),
            description: None,
            kernel_arguments: Vec::new(),
            metadata: String::new(),
            machine: None,
            accelerators: Vec::new(),
        }
    }
}

/// Loads and parses an image configuration document.
///
/// # Errors
///
/// Returns [`ImageConfigError::Read`] or [`ImageConfigError::Parse`].
pub fn load_image_config(path: &Utf8Path) -> Result<ImageConfigFile, ImageConfigError> {
    let raw = read_to_string_ambient(path).map_err(|message| ImageConfigError::Read {
        path: path.to_string(),
        message,
    })?;
    parse_image_config(path, &raw)
}

/// Parses an image configuration document already in memory.
///
/// # Errors
///
/// Returns [`ImageConfigError::Parse`] when the document is malformed.
pub fn parse_image_config(path: &Utf8Path, raw: &str) -> Result<ImageConfigFile, ImageConfigError> {
    serde_yaml::from_str(raw).map_err(|err| ImageConfigError::Parse {
        path: path.to_string(),
        message: err.to_string(),
    })
}

/// Collects every image to test, keyed and ordered by short name.
///
/// Bare `images` are added after the document entries and replace entries
/// with the same short name.
///
/// # Errors
///
/// Returns [`ImageConfigError`] for incomplete entries or when bare images
/// are given without an image project.
pub fn collect_image_specs(
    document: Option<&ImageConfigFile>,
    images: &[String],
    image_project: Option<&str>,
) -> Result<Vec<ImageSpec>, ImageConfigError> {
    let mut specs = BTreeMap::new();
    if let Some(file) = document {
        for (short_name, entry) in &file.images {
            specs.insert(short_name.clone(), ImageSpec::from_entry(short_name, entry)?);
        }
    }

    let bare: Vec<&str> = images
        .iter()
        .map(|image| image.trim())
        .filter(|image| !image.is_empty())
        .collect();
    if !bare.is_empty() {
        let project = image_project
            .and_then(non_empty)
            .ok_or(ImageConfigError::MissingImageProject)?;
        for image in bare {
            specs.insert(image.to_owned(), ImageSpec::named(image, &project));
        }
    }

    Ok(specs.into_values().collect())
}
