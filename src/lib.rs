//! Core library for the node e2e runner.
//!
//! The crate provisions one throwaway Compute Engine instance per configured
//! image, waits until the instance is ready for testing, optionally applies
//! kernel arguments with a reboot, hands the host to a test executor over SSH
//! and tears everything down afterwards. Every image runs in its own task and
//! reports a single [`TestOutcome`].

pub mod config;
pub mod gce;
pub mod image_config;
pub mod lifecycle;
pub mod metadata;
pub mod provider;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod run;
pub mod runner;
pub mod test_support;
pub mod util;

pub use config::{ConfigError, RunnerConfig};
pub use gce::{GceClient, MetadataServerToken, StaticToken, TokenSource};
pub use image_config::{ImageConfigError, ImageSource, ImageSpec};
pub use lifecycle::{LifecycleError, ReadinessBudgets, ReadinessStage, RebootPolicy};
pub use provider::{ComputeApi, Placement, ProviderError};
pub use registry::{GCE_RUNNER, RunnerError, RunnerRegistry, TestRunner};
pub use remote::{HostRegistry, RemoteExecError, RemoteExecutor, SshConfig, SshExecutor};
pub use retry::{Clock, RetryPolicy, TokioClock};
pub use run::{Orchestrator, RunError, RunSettings, Services, TestExecutor, TestOutcome};
pub use runner::GceRunner;
