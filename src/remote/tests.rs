//! Unit tests for the SSH executor.

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};

/// Helper to assert validation rejects empty or whitespace values for a given field.
fn assert_validation_rejects_field<F>(mut cfg: SshConfig, field_name: &str, set_field: F)
where
    F: Fn(&mut SshConfig, String),
{
    for invalid in ["", "  "] {
        set_field(&mut cfg, invalid.to_owned());
        let Err(err) = cfg.validate() else {
            panic!("{field_name} '{invalid}' should fail");
        };
        let RemoteExecError::InvalidConfig { ref field } = err else {
            panic!("expected InvalidConfig for {field_name}, got {err:?}");
        };
        assert_eq!(field, field_name, "expected invalid field {field_name}");
    }
}

#[fixture]
fn base_config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        ssh_user: Some(String::from("prow")),
        ssh_port: 22,
        ssh_identity_file: None,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_connect_timeout_secs: 30,
        ssh_use_sudo: true,
    }
}

fn executor(config: SshConfig, runner: &ScriptedRunner) -> SshExecutor<ScriptedRunner> {
    SshExecutor::new(config, runner.clone(), HostRegistry::new())
        .unwrap_or_else(|err| panic!("config should be valid: {err}"))
}

#[rstest]
fn ssh_config_validate_accepts_defaults(base_config: SshConfig) {
    assert!(base_config.validate().is_ok());
}

#[rstest]
fn ssh_config_validation_rejects_ssh_bin(base_config: SshConfig) {
    assert_validation_rejects_field(base_config, "ssh_bin", |cfg, val| cfg.ssh_bin = val);
}

#[rstest]
fn ssh_config_validation_rejects_ssh_user(base_config: SshConfig) {
    assert_validation_rejects_field(base_config, "ssh_user", |cfg, val| {
        cfg.ssh_user = Some(val);
    });
}

#[rstest]
fn ssh_config_validation_rejects_zero_port(base_config: SshConfig) {
    let cfg = SshConfig {
        ssh_port: 0,
        ..base_config
    };
    let err = cfg.validate().expect_err("port zero should fail");
    assert_eq!(
        err,
        RemoteExecError::InvalidConfig {
            field: String::from("ssh_port")
        }
    );
    assert!(err.to_string().contains("NODE_E2E_SSH_SSH_PORT"));
}

#[rstest]
#[tokio::test]
async fn registered_address_replaces_host_name(base_config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success("6.1.0\n");
    let exec = executor(base_config, &runner);
    exec.registry().register("tmp-node-e2e-cos", "203.0.113.7");

    let output = exec
        .run("tmp-node-e2e-cos", &["uname", "-r"])
        .await
        .expect("command should succeed");

    assert_eq!(output, "6.1.0\n");
    let invocations = runner.invocations();
    let invocation = invocations.first().expect("one invocation");
    assert_eq!(invocation.program, "ssh");
    assert_eq!(
        invocation.arg_strings(),
        vec![
            "-p",
            "22",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=30",
            "prow@203.0.113.7",
            "--",
            "sudo uname -r",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn unregistered_host_is_addressed_by_name(base_config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success("");
    let cfg = SshConfig {
        ssh_user: None,
        ssh_use_sudo: false,
        ..base_config
    };
    let exec = executor(cfg, &runner);

    exec.run("bare-host", &["true"])
        .await
        .expect("command should succeed");

    let args = runner
        .invocations()
        .first()
        .map(CommandInvocationExt::tail)
        .expect("one invocation");
    assert_eq!(args, vec!["bare-host", "--", "true"]);
}

#[rstest]
#[tokio::test]
async fn arguments_are_shell_escaped(base_config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success("containerd.service loaded active running");
    let exec = executor(base_config, &runner);

    exec.run("host", &["sh", "-c", "systemctl list-units | grep containerd"])
        .await
        .expect("command should succeed");

    let remote = runner
        .invocations()
        .first()
        .and_then(|invocation| invocation.arg_strings().last().cloned())
        .expect("remote command present");
    assert_eq!(remote, "sudo sh -c 'systemctl list-units | grep containerd'");
}

#[rstest]
#[tokio::test]
async fn identity_file_and_port_are_forwarded(base_config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success("");
    let cfg = SshConfig {
        ssh_port: 2222,
        ssh_identity_file: Some(String::from("/keys/google_compute_engine")),
        ..base_config
    };
    let exec = executor(cfg, &runner);

    exec.run("host", &["true"]).await.expect("command should succeed");

    let args = runner
        .invocations()
        .first()
        .map(crate::test_support::CommandInvocation::arg_strings)
        .expect("one invocation");
    assert_eq!(
        args.get(..4),
        Some(
            [
                String::from("-p"),
                String::from("2222"),
                String::from("-i"),
                String::from("/keys/google_compute_engine"),
            ]
            .as_slice()
        )
    );
}

#[rstest]
#[tokio::test]
async fn non_zero_exit_maps_to_command_failed(base_config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "partial\n", "ls: cannot access\n");
    let exec = executor(base_config, &runner);

    let err = exec
        .run("host", &["ls", "/var/lib/cloud/instance/boot-finished"])
        .await
        .expect_err("non-zero exit should fail");

    assert_eq!(
        err,
        RemoteExecError::CommandFailed {
            host: String::from("host"),
            status: Some(1),
            status_text: String::from("1"),
            output: String::from("partial\nls: cannot access\n"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn missing_exit_status_is_reported_as_unknown(base_config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(None, "", "killed");
    let exec = executor(base_config, &runner);

    let err = exec
        .run("host", &["reboot"])
        .await
        .expect_err("signal termination should fail");

    assert!(err.to_string().contains("exited with status unknown"));
}

#[rstest]
#[tokio::test]
async fn spawn_failure_propagates(base_config: SshConfig) {
    let runner = ScriptedRunner::new();
    let exec = executor(base_config, &runner);

    let err = exec
        .run("host", &["true"])
        .await
        .expect_err("empty script should fail to spawn");

    assert!(matches!(err, RemoteExecError::Spawn { ref program, .. } if program == "ssh"));
    assert_eq!(err.output(), "");
}

trait CommandInvocationExt {
    fn tail(&self) -> Vec<String>;
}

impl CommandInvocationExt for crate::test_support::CommandInvocation {
    /// Arguments following the common SSH options.
    fn tail(&self) -> Vec<String> {
        let args = self.arg_strings();
        let start = args
            .iter()
            .position(|arg| arg.starts_with("ConnectTimeout="))
            .map_or(0, |index| index + 1);
        args.into_iter().skip(start).collect()
    }
}
