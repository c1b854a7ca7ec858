//! Runner factory table.
//!
//! Backends register a constructor under a name; the binary picks one by name
//! and drives it through the [`TestRunner`] capability interface.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{ConfigError, RunnerConfig};
use crate::image_config::ImageConfigError;
use crate::provider::ProviderError;
use crate::remote::{RemoteExecError, SshConfig};
use crate::run::TestOutcome;
use crate::runner::GceRunner;

/// Name the GCE runner is registered under.
pub const GCE_RUNNER: &str = "gce";

/// Future returned by [`TestRunner::validate`].
pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send + 'a>>;

/// Errors raised while preparing or starting a runner.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when no runner is registered under the requested name.
    #[error("unknown runner `{name}`; available: {available}")]
    UnknownRunner {
        /// Requested name.
        name: String,
        /// Comma-separated registered names.
        available: String,
    },
    /// Raised when neither an image config file nor images are given.
    #[error("must specify one of --image-config-file or --images")]
    NoImages,
    /// Raised when tests are started before validation succeeded.
    #[error("runner must be validated before tests are started")]
    NotValidated,
    /// Raised for invalid runner configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when the image configuration cannot be used.
    #[error(transparent)]
    ImageConfig(#[from] ImageConfigError),
    /// Raised when the provider client cannot be created.
    #[error("unable to create compute client; make sure credentials are available: {0}")]
    Provider(#[from] ProviderError),
    /// Raised for invalid SSH settings.
    #[error(transparent)]
    Remote(#[from] RemoteExecError),
}

/// Capability interface every runner backend implements.
pub trait TestRunner: Send + Sync {
    /// Checks configuration, connects to the provider and prepares the image
    /// list.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] describing the first problem found.
    fn validate(&mut self) -> RunnerFuture<'_>;

    /// Launches one pipeline per image running `command` and returns how many
    /// outcomes will arrive on `results`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::NotValidated`] when called before
    /// [`TestRunner::validate`] succeeded.
    fn start_tests(
        &self,
        command: &[String],
        results: &UnboundedSender<TestOutcome>,
    ) -> Result<usize, RunnerError>;
}

/// Constructor stored in a [`RunnerRegistry`].
pub type RunnerFactory = fn(RunnerConfig, SshConfig) -> Box<dyn TestRunner>;

fn gce_factory(config: RunnerConfig, ssh: SshConfig) -> Box<dyn TestRunner> {
    Box::new(GceRunner::new(config, ssh))
}

/// Name to constructor table.
#[derive(Clone, Debug, Default)]
pub struct RunnerRegistry {
    factories: BTreeMap<&'static str, RunnerFactory>,
}

impl RunnerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in runners.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(GCE_RUNNER, gce_factory);
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &'static str, factory: RunnerFactory) {
        self.factories.insert(name, factory);
    }

    /// Registered names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Builds the runner registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::UnknownRunner`] when nothing is registered under
    /// `name`.
    pub fn create(
        &self,
        name: &str,
        config: RunnerConfig,
        ssh: SshConfig,
    ) -> Result<Box<dyn TestRunner>, RunnerError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RunnerError::UnknownRunner {
                name: name.to_owned(),
                available: self.names().join(", "),
            })?;
        Ok(factory(config, ssh))
    }
}
