//! SSH configuration and remote execution errors.
//!
//! [`SshConfig`] is loaded via `ortho-config`, merging defaults, configuration
//! files and `NODE_E2E_SSH_*` environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// SSH client settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODE_E2E_SSH",
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
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as; the client default applies when unset.
    pub ssh_user: Option<String>,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Path to the private key used for authentication. Supports tilde
    /// expansion.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; disabled for ephemeral hosts.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Seconds to wait for the TCP connection before giving up.
    #[ortho_config(default = 30)]
    pub ssh_connect_timeout_secs: u64,
    /// Whether remote commands run through `sudo`.
    #[ortho_config(default = true)]
    pub ssh_use_sudo: bool,
}

impl SshConfig {
    /// Loads configuration from defaults, configuration files and environment
    /// variables without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::InvalidConfig`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, RemoteExecError> {
        Self::load_from_iter([std::ffi::OsString::from("node-e2e-runner")]).map_err(|err| {
            RemoteExecError::InvalidConfig {
                field: format!("ssh configuration ({err})"),
            }
        })
    }

    /// Ensures configured values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), RemoteExecError> {
        Self::require_value(Some(&self.ssh_bin), "ssh_bin")?;
        Self::require_value(self.ssh_user.as_deref(), "ssh_user")?;
        Self::require_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        if self.ssh_port == 0 {
            return Err(RemoteExecError::InvalidConfig {
                field: String::from("ssh_port"),
            });
        }
        Ok(())
    }

    fn require_value(value: Option<&str>, field: &str) -> Result<(), RemoteExecError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(RemoteExecError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }
}

/// Errors surfaced while running commands on a remote host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteExecError {
    /// Raised when SSH settings are invalid.
    #[error(
        "invalid {field}: set NODE_E2E_SSH_{env_suffix} or fix {field} in node-e2e.toml",
        env_suffix = field.to_uppercase()
    )]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when the local SSH client cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the remote command exits unsuccessfully.
    #[error("command on {host} exited with status {status_text}: {output}")]
    CommandFailed {
        /// Host the command ran on.
        host: String,
        /// Exit status as reported by the SSH client.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Combined stdout and stderr.
        output: String,
    },
}

impl RemoteExecError {
    /// Output captured before the failure, empty when nothing ran.
    #[must_use]
    pub fn output(&self) -> &str {
        match self {
            Self::CommandFailed { output, .. } => output,
            Self::InvalidConfig { .. } | Self::Spawn { .. } => "",
        }
    }
}
