//! Test support utilities shared across unit and integration tests.
//!
//! Every double records what it was asked to do so tests can assert on the
//! exact sequence of provider calls, remote commands and sleeps.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::config::{DEFAULT_INSTANCE_TYPE, RunnerConfig};
use crate::provider::{
    ComputeApi, ImageRecord, InstanceRecord, InstanceRequest, InstanceStatus, OperationError,
    OperationHandle, OperationStatus, Placement, ProviderError, ProviderFuture,
};
use crate::remote::{
    CommandFuture, CommandOutput, CommandRunner, RemoteExecError, RemoteExecutor, RemoteFuture,
    SshConfig,
};
use crate::retry::{Clock, SleepFuture};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns the arguments as UTF-8 strings for assertions.
    #[must_use]
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_success(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        Box::pin(async move {
            locked(&self.invocations).push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
            locked(&self.responses)
                .pop_front()
                .ok_or_else(|| RemoteExecError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }
}

/// Command observed by [`ScriptedRemote`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCall {
    /// Host the command targeted.
    pub host: String,
    /// Arguments joined with single spaces.
    pub command: String,
}

#[derive(Debug)]
struct RemoteRule {
    needle: String,
    responses: VecDeque<Result<String, RemoteExecError>>,
}

#[derive(Debug, Default)]
struct RemoteState {
    rules: Vec<RemoteRule>,
    calls: Vec<RemoteCall>,
}

/// In-memory [`RemoteExecutor`] answering by substring rules.
///
/// The first rule whose needle occurs in the joined command answers. Each
/// rule replays its responses in order and repeats the final one. Commands
/// that match no rule succeed with empty output.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl ScriptedRemote {
    /// Creates a remote with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a remote whose hosts report a running containerd.
    #[must_use]
    pub fn healthy() -> Self {
        let remote = Self::new();
        remote.succeed("systemctl", "containerd.service loaded active running");
        remote
    }

    /// Adds a rule replaying `responses` for commands containing `needle`.
    pub fn respond(
        &self,
        needle: &str,
        responses: impl IntoIterator<Item = Result<String, RemoteExecError>>,
    ) {
        locked(&self.state).rules.push(RemoteRule {
            needle: needle.to_owned(),
            responses: responses.into_iter().collect(),
        });
    }

    /// Adds a rule that always succeeds with `output`.
    pub fn succeed(&self, needle: &str, output: &str) {
        self.respond(needle, [Ok(output.to_owned())]);
    }

    /// Adds a rule that always fails with `output`.
    pub fn fail(&self, needle: &str, output: &str) {
        self.respond(needle, [Err(remote_failure("scripted", output))]);
    }

    /// Returns every command observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        locked(&self.state).calls.clone()
    }

    /// Counts observed commands containing `needle`.
    #[must_use]
    pub fn count(&self, needle: &str) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|call| call.command.contains(needle))
            .count()
    }

    fn answer(&self, host: &str, command: String) -> Result<String, RemoteExecError> {
        let mut state = locked(&self.state);
        let response = state
            .rules
            .iter_mut()
            .find(|rule| command.contains(&rule.needle))
            .and_then(|rule| {
                if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                }
            });
        state.calls.push(RemoteCall {
            host: host.to_owned(),
            command,
        });
        response.unwrap_or_else(|| Ok(String::new()))
    }
}

impl RemoteExecutor for ScriptedRemote {
    fn run<'a>(&'a self, host: &'a str, argv: &'a [&'a str]) -> RemoteFuture<'a> {
        let command = argv.join(" ");
        Box::pin(async move { self.answer(host, command) })
    }
}

/// Builds the error a failed remote command produces.
#[must_use]
pub fn remote_failure(host: &str, output: &str) -> RemoteExecError {
    RemoteExecError::CommandFailed {
        host: host.to_owned(),
        status: Some(255),
        status_text: String::from("255"),
        output: output.to_owned(),
    }
}

/// [`Clock`] that records requested sleeps and returns immediately.
#[derive(Clone, Debug, Default)]
pub struct FakeClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    /// Creates a clock with no recorded sleeps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every sleep requested so far.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        locked(&self.sleeps).clone()
    }
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        locked(&self.sleeps).push(duration);
        Box::pin(async {})
    }
}

#[derive(Debug, Default)]
struct ComputeState {
    images: BTreeMap<String, Vec<ImageRecord>>,
    instances: BTreeMap<String, InstanceRecord>,
    status_scripts: BTreeMap<String, VecDeque<String>>,
    operation_scripts: BTreeMap<String, VecDeque<Result<OperationHandle, ProviderError>>>,
    inserted: Vec<InstanceRequest>,
    deleted: Vec<String>,
    calls: Vec<String>,
    list_error: Option<ProviderError>,
    lookup_error: Option<ProviderError>,
    insert_error: Option<ProviderError>,
    insert_operation_errors: Vec<OperationError>,
    delete_error: Option<ProviderError>,
    serial_output: Option<Result<String, ProviderError>>,
    external_ip: Option<String>,
}

/// In-memory [`ComputeApi`].
///
/// Inserted instances become visible immediately with status `RUNNING` and
/// the configured external IP; per-instance status scripts and per-operation
/// scripts override what lookups return. Scripts replay in order and repeat
/// their final entry.
#[derive(Clone, Debug)]
pub struct FakeCompute {
    state: Arc<Mutex<ComputeState>>,
}

impl Default for FakeCompute {
    fn default() -> Self {
        let state = ComputeState {
            external_ip: Some(String::from("203.0.113.10")),
            ..ComputeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

/// Service account email returned by [`FakeCompute`].
pub const FAKE_SERVICE_ACCOUNT: &str = "123456-compute@developer.gserviceaccount.com";

impl FakeCompute {
    /// Creates an empty fake provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an image to `project`.
    pub fn add_image(&self, project: &str, name: &str, family: Option<&str>, created: &str) {
        locked(&self.state)
            .images
            .entry(project.to_owned())
            .or_default()
            .push(ImageRecord {
                name: name.to_owned(),
                family: family.map(str::to_owned),
                creation_timestamp: created.to_owned(),
            });
    }

    /// Registers a pre-existing instance.
    pub fn add_instance(&self, record: InstanceRecord) {
        locked(&self.state)
            .instances
            .insert(record.name.clone(), record);
    }

    /// Scripts the statuses successive lookups of `name` report.
    pub fn script_statuses(&self, name: &str, statuses: &[&str]) {
        locked(&self.state).status_scripts.insert(
            name.to_owned(),
            statuses.iter().map(|status| (*status).to_owned()).collect(),
        );
    }

    /// Scripts the results successive lookups of operation `name` return.
    pub fn script_operation(
        &self,
        name: &str,
        results: impl IntoIterator<Item = Result<OperationHandle, ProviderError>>,
    ) {
        locked(&self.state)
            .operation_scripts
            .insert(name.to_owned(), results.into_iter().collect());
    }

    /// Makes image listing fail.
    pub fn fail_listing(&self, error: ProviderError) {
        locked(&self.state).list_error = Some(error);
    }

    /// Makes instance lookups fail.
    pub fn fail_lookup(&self, error: ProviderError) {
        locked(&self.state).lookup_error = Some(error);
    }

    /// Makes insert submissions fail.
    pub fn fail_insert(&self, error: ProviderError) {
        locked(&self.state).insert_error = Some(error);
    }

    /// Attaches errors to the operation returned by insert submissions.
    pub fn reject_insert(&self, errors: Vec<OperationError>) {
        locked(&self.state).insert_operation_errors = errors;
    }

    /// Makes deletions fail.
    pub fn fail_delete(&self, error: ProviderError) {
        locked(&self.state).delete_error = Some(error);
    }

    /// Sets the serial console result.
    pub fn set_serial_output(&self, result: Result<String, ProviderError>) {
        locked(&self.state).serial_output = Some(result);
    }

    /// Sets the external IP given to inserted instances.
    pub fn set_external_ip(&self, ip: Option<&str>) {
        locked(&self.state).external_ip = ip.map(str::to_owned);
    }

    /// Returns every insert request received.
    #[must_use]
    pub fn inserted(&self) -> Vec<InstanceRequest> {
        locked(&self.state).inserted.clone()
    }

    /// Returns every instance name deleted.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        locked(&self.state).deleted.clone()
    }

    /// Returns a log of calls in `<method>:<subject>` form.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.state).calls.clone()
    }

    /// Counts logged calls starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Operation name [`FakeCompute`] returns for inserts of `instance`.
#[must_use]
pub fn insert_operation_name(instance: &str) -> String {
    format!("operation-insert-{instance}")
}

/// Builds a finished operation handle.
#[must_use]
pub fn done_operation(name: &str) -> OperationHandle {
    OperationHandle {
        name: name.to_owned(),
        status: OperationStatus::Done,
        errors: Vec::new(),
    }
}

/// Builds an operation handle in `status`.
#[must_use]
pub fn operation(name: &str, status: OperationStatus) -> OperationHandle {
    OperationHandle {
        name: name.to_owned(),
        status,
        errors: Vec::new(),
    }
}

impl ComputeApi for FakeCompute {
    fn list_images<'a>(&'a self, project: &'a str) -> ProviderFuture<'a, Vec<ImageRecord>> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.calls.push(format!("list_images:{project}"));
            if let Some(error) = state.list_error.clone() {
                return Err(error);
            }
            Ok(state.images.get(project).cloned().unwrap_or_default())
        })
    }

    fn get_instance<'a>(
        &'a self,
        _placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<InstanceRecord>> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.calls.push(format!("get_instance:{name}"));
            if let Some(error) = state.lookup_error.clone() {
                return Err(error);
            }
            let scripted = state
                .status_scripts
                .get_mut(name)
                .and_then(next_scripted);
            let mut record = state.instances.get(name).cloned();
            if let (Some(instance), Some(status)) = (record.as_mut(), scripted) {
                instance.status = InstanceStatus::new(status);
            }
            Ok(record)
        })
    }

    fn insert_instance<'a>(
        &'a self,
        _placement: &'a Placement,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, OperationHandle> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.calls.push(format!("insert_instance:{}", request.name));
            if let Some(error) = state.insert_error.clone() {
                return Err(error);
            }
            state.inserted.push(request.clone());
            let handle = OperationHandle {
                name: insert_operation_name(&request.name),
                status: OperationStatus::Pending,
                errors: state.insert_operation_errors.clone(),
            };
            if handle.has_errors() {
                return Ok(handle);
            }
            let record = InstanceRecord {
                name: request.name.clone(),
                status: InstanceStatus::new(InstanceStatus::RUNNING),
                machine_type: request.machine_type.clone(),
                external_ip: state.external_ip.clone(),
                metadata: request.metadata.clone(),
            };
            state.instances.insert(request.name.clone(), record);
            Ok(handle)
        })
    }

    fn get_operation<'a>(
        &'a self,
        _placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, OperationHandle> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.calls.push(format!("get_operation:{name}"));
            state
                .operation_scripts
                .get_mut(name)
                .and_then(next_scripted)
                .unwrap_or_else(|| Ok(done_operation(name)))
        })
    }

    fn serial_port_output<'a>(
        &'a self,
        _placement: &'a Placement,
        name: &'a str,
        port: u32,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.calls.push(format!("serial_port_output:{name}:{port}"));
            state
                .serial_output
                .clone()
                .unwrap_or_else(|| Ok(format!("serial console of {name}\n")))
        })
    }

    fn delete_instance<'a>(
        &'a self,
        _placement: &'a Placement,
        name: &'a str,
    ) -> ProviderFuture<'a, OperationHandle> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.calls.push(format!("delete_instance:{name}"));
            if let Some(error) = state.delete_error.clone() {
                return Err(error);
            }
            state.instances.remove(name);
            state.deleted.push(name.to_owned());
            Ok(operation(
                &format!("operation-delete-{name}"),
                OperationStatus::Pending,
            ))
        })
    }

    fn default_service_account<'a>(&'a self, project: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            locked(&self.state)
                .calls
                .push(format!("default_service_account:{project}"));
            Ok(String::from(FAKE_SERVICE_ACCOUNT))
        })
    }
}

/// Runner configuration with a project and zone and nothing else set.
#[must_use]
pub fn runner_config() -> RunnerConfig {
    RunnerConfig {
        project: String::from("node-e2e"),
        zone: String::from("us-central1-f"),
        image_project: None,
        instance_type: DEFAULT_INSTANCE_TYPE.to_owned(),
        preemptible_instances: false,
        instance_metadata: None,
        instance_name_prefix: None,
        image_config_file: None,
        image_config_dir: None,
        images: None,
        node_env: None,
        delete_instances: true,
        cleanup: true,
        inject_ssh_public_key: false,
        ssh_public_key_file: None,
        artifacts_dir: String::from("_artifacts"),
        access_token: None,
        compute_api_base: None,
    }
}

/// SSH configuration matching the defaults.
#[must_use]
pub fn ssh_config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        ssh_user: None,
        ssh_port: 22,
        ssh_identity_file: None,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_connect_timeout_secs: 30,
        ssh_use_sudo: true,
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
