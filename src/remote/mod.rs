//! Remote command execution on provisioned hosts.
//!
//! Commands are passed as argument vectors, shell-escaped into a single
//! remote command string, and executed through the system `ssh` client. The
//! target address comes from the shared [`HostRegistry`], falling back to the
//! host name when no address was registered.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;

use shell_escape::unix::escape;
use tracing::debug;

mod config;
mod registry;
mod types;

pub use config::{RemoteExecError, SshConfig};
pub use registry::HostRegistry;
pub use types::{CommandFuture, CommandOutput, CommandRunner, ProcessCommandRunner};

use crate::util::expand_tilde;

/// Future returned by [`RemoteExecutor::run`].
pub type RemoteFuture<'a> = Pin<Box<dyn Future<Output = Result<String, RemoteExecError>> + Send + 'a>>;

/// Runs commands on a named host.
pub trait RemoteExecutor: Send + Sync {
    /// Runs `argv` on `host` and returns the combined output.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::Spawn`] when the transport cannot start and
    /// [`RemoteExecError::CommandFailed`] on a non-zero exit.
    fn run<'a>(&'a self, host: &'a str, argv: &'a [&'a str]) -> RemoteFuture<'a>;
}

/// [`RemoteExecutor`] backed by the system SSH client.
#[derive(Clone, Debug)]
pub struct SshExecutor<R: CommandRunner> {
    config: SshConfig,
    runner: R,
    registry: HostRegistry,
}

impl SshExecutor<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(
        config: SshConfig,
        registry: HostRegistry,
    ) -> Result<Self, RemoteExecError> {
        Self::new(config, ProcessCommandRunner, registry)
    }
}

impl<R: CommandRunner> SshExecutor<R> {
    /// Creates an executor using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteExecError::InvalidConfig`] when validation fails.
    pub fn new(
        config: SshConfig,
        runner: R,
        registry: HostRegistry,
    ) -> Result<Self, RemoteExecError> {
        config.validate()?;
        Ok(Self {
            config,
            runner,
            registry,
        })
    }

    /// Returns the registry used to resolve host addresses.
    #[must_use]
    pub const fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    fn build_ssh_args(&self, host: &str, argv: &[&str]) -> Vec<OsString> {
        let mut args = self.common_ssh_options();
        let address = self.registry.address_for(host);
        let target = match self.config.ssh_user.as_deref() {
            Some(user) => format!("{user}@{address}"),
            None => address,
        };
        args.push(OsString::from(target));
        args.push(OsString::from("--"));
        args.push(OsString::from(self.remote_command(argv)));
        args
    }

    fn remote_command(&self, argv: &[&str]) -> String {
        let escaped = argv
            .iter()
            .map(|arg| escape((*arg).into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if self.config.ssh_use_sudo {
            format!("sudo {escaped}")
        } else {
            escaped
        }
    }

    fn common_ssh_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.ssh_port.to_string()),
        ];

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.ssh_connect_timeout_secs
        )));

        args
    }
}

impl<R: CommandRunner> RemoteExecutor for SshExecutor<R> {
    fn run<'a>(&'a self, host: &'a str, argv: &'a [&'a str]) -> RemoteFuture<'a> {
        Box::pin(async move {
            let args = self.build_ssh_args(host, argv);
            debug!(instance = host, command = %argv.join(" "), "running remote command");
            let output = self.runner.run(&self.config.ssh_bin, &args).await?;
            if output.is_success() {
                return Ok(output.combined());
            }
            Err(RemoteExecError::CommandFailed {
                host: host.to_owned(),
                status: output.code,
                status_text: output.status_text(),
                output: output.combined(),
            })
        })
    }
}

#[cfg(test)]
mod tests;
