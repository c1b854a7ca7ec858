//! Image resolution: selector plus project to one concrete image name.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use tracing::info;

use crate::image_config::{ImageSource, ImageSpec};
use crate::provider::{ComputeApi, ImageRecord};

use super::LifecycleError;

/// Resolves image selectors against the provider's image listing.
#[derive(Clone)]
pub struct ImageResolver {
    compute: Arc<dyn ComputeApi>,
}

impl ImageResolver {
    /// Creates a resolver listing through `compute`.
    #[must_use]
    pub fn new(compute: Arc<dyn ComputeApi>) -> Self {
        Self { compute }
    }

    /// Returns the concrete image name for `spec`.
    ///
    /// # Errors
    ///
    /// See [`ImageResolver::resolve`].
    pub async fn image_name(&self, spec: &ImageSpec) -> Result<String, LifecycleError> {
        match &spec.source {
            ImageSource::Named(name) => Ok(name.clone()),
            ImageSource::Latest { regex, family } => {
                self.resolve(regex.as_deref(), family.as_deref(), &spec.project)
                    .await
            }
        }
    }

    /// Returns the newest image in `project` whose name matches `regex` and
    /// whose family equals `family`. Empty or absent filters match everything.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidRegex`] before listing when the
    /// pattern does not compile, [`LifecycleError::Provider`] when listing
    /// fails, and the errors of [`select_latest`].
    pub async fn resolve(
        &self,
        regex: Option<&str>,
        family: Option<&str>,
        project: &str,
    ) -> Result<String, LifecycleError> {
        let pattern = regex.filter(|value| !value.is_empty());
        let compiled = pattern
            .map(|value| {
                Regex::new(value).map_err(|err| LifecycleError::InvalidRegex {
                    pattern: value.to_owned(),
                    message: err.to_string(),
                })
            })
            .transpose()?;
        let family_filter = family.filter(|value| !value.is_empty());

        let images = self.compute.list_images(project).await?;
        let selected = select_latest(images, compiled.as_ref(), family_filter)?.ok_or_else(|| {
            LifecycleError::NoMatchingImage {
                project: project.to_owned(),
                regex: pattern.unwrap_or_default().to_owned(),
                family: family_filter.unwrap_or_default().to_owned(),
            }
        })?;
        info!(
            image = %selected.name,
            project,
            created = %selected.creation_timestamp,
            "resolved latest image"
        );
        Ok(selected.name)
    }
}

/// Filters `images` and returns the one with the newest creation timestamp.
///
/// Ties keep listing order. Returns `Ok(None)` when nothing passes the
/// filters.
///
/// # Errors
///
/// Returns [`LifecycleError::TimestampParse`] when a candidate's timestamp is
/// not RFC 3339.
pub fn select_latest(
    images: Vec<ImageRecord>,
    regex: Option<&Regex>,
    family: Option<&str>,
) -> Result<Option<ImageRecord>, LifecycleError> {
    let mut candidates: Vec<(DateTime<FixedOffset>, ImageRecord)> = images
        .into_iter()
        .filter(|image| regex.is_none_or(|pattern| pattern.is_match(&image.name)))
        .filter(|image| family.is_none_or(|wanted| image.family.as_deref() == Some(wanted)))
        .map(|image| {
            DateTime::parse_from_rfc3339(&image.creation_timestamp)
                .map(|created| (created, image.clone()))
                .map_err(|err| LifecycleError::TimestampParse {
                    image: image.name.clone(),
                    value: image.creation_timestamp.clone(),
                    message: err.to_string(),
                })
        })
        .collect::<Result<_, _>>()?;
    candidates.sort_by(|lhs, rhs| rhs.0.cmp(&lhs.0));
    Ok(candidates.into_iter().next().map(|(_, image)| image))
}
