//! Kernel command-line reconfiguration.
//!
//! Each supported image family maps to a generator producing the shell
//! commands that append arguments to the boot configuration. The commands
//! are chained with `&&` and run in a single remote shell.

use std::fmt;

use tracing::{info, warn};

use crate::remote::RemoteExecutor;

use super::LifecycleError;

/// Image family, resolved once from the image name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageFamily {
    /// Container-Optimized OS.
    ContainerOptimized,
    /// Ubuntu.
    Ubuntu,
    /// Anything else; kernel arguments are not supported.
    Unknown,
}

impl ImageFamily {
    /// Classifies an image name. `ubuntu` wins over `cos` when both occur.
    #[must_use]
    pub fn classify(image: &str) -> Self {
        if image.contains("ubuntu") {
            Self::Ubuntu
        } else if image.contains("cos") {
            Self::ContainerOptimized
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ImageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContainerOptimized => f.write_str("cos"),
            Self::Ubuntu => f.write_str("ubuntu"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

type CommandGenerator = fn(&str) -> Vec<String>;

const COMMAND_TABLE: [(ImageFamily, CommandGenerator); 2] = [
    (ImageFamily::ContainerOptimized, cos_commands),
    (ImageFamily::Ubuntu, ubuntu_commands),
];

fn cos_commands(args: &str) -> Vec<String> {
    vec![
        String::from("dir=$(mktemp -d)"),
        String::from("mount /dev/sda12 ${dir}"),
        format!(r#"sed -i -e "s|cros_efi|cros_efi {args}|g" ${{dir}}/efi/boot/grub.cfg"#),
        String::from("umount ${dir}"),
        String::from("rmdir ${dir}"),
    ]
}

fn ubuntu_commands(args: &str) -> Vec<String> {
    vec![
        format!(
            r#"echo "GRUB_CMDLINE_LINUX_DEFAULT={args} ${{GRUB_CMDLINE_LINUX_DEFAULT}}" > /etc/default/grub.d/99-additional-arguments.cfg"#
        ),
        String::from("/usr/sbin/update-grub"),
    ]
}

/// Returns the chained shell command for `family`, or `None` when the family
/// is not supported.
#[must_use]
pub fn kernel_update_command(family: ImageFamily, arguments: &[String]) -> Option<String> {
    let (_, generator) = COMMAND_TABLE
        .iter()
        .find(|(candidate, _)| *candidate == family)?;
    Some(generator(&arguments.join(" ")).join(" && "))
}

/// Outcome of a kernel argument update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelUpdate {
    /// The boot configuration changed; a reboot is required.
    Applied,
    /// Nothing was changed.
    Skipped,
}

/// Applies kernel arguments to a ready instance.
pub struct KernelArgumentReconfigurer<'a> {
    remote: &'a dyn RemoteExecutor,
}

impl<'a> KernelArgumentReconfigurer<'a> {
    /// Creates a reconfigurer running commands through `remote`.
    #[must_use]
    pub const fn new(remote: &'a dyn RemoteExecutor) -> Self {
        Self { remote }
    }

    /// Appends `arguments` to the kernel command line of `host`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::KernelArguments`] when the remote command
    /// fails. Failures are not retried.
    pub async fn apply(
        &self,
        host: &str,
        family: ImageFamily,
        arguments: &[String],
    ) -> Result<KernelUpdate, LifecycleError> {
        if arguments.is_empty() {
            return Ok(KernelUpdate::Skipped);
        }
        let Some(command) = kernel_update_command(family, arguments) else {
            warn!(
                instance = host,
                family = %family,
                "kernel arguments are not supported for this image family, skipping"
            );
            return Ok(KernelUpdate::Skipped);
        };

        info!(instance = host, family = %family, "updating kernel arguments");
        self.remote
            .run(host, &["sh", "-c", command.as_str()])
            .await
            .map_err(|source| LifecycleError::KernelArguments {
                instance: host.to_owned(),
                source,
            })?;
        Ok(KernelUpdate::Applied)
    }
}
