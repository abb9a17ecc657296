//! Ephemeral session supervisor
//!
//! [`EphemeralRunner`] owns everything resolved up front (policy, mounts,
//! network policy, call gateway). Each [`Session`] is one container driven
//! through the state machine
//! `Created -> Starting -> Running -> Stopping -> Closed`, with `Error`
//! reachable from `Starting` and `Running`.

use crate::bootstrap::Bootstrap;
use crate::calls::{CallServer, RemoteCallGateway, SOCKET_NAME};
use crate::config::{resolve_for, ConfigDocument, ConfigLoader, ResolvedPolicy, SandboxConfig};
use crate::driver::{
    CommandFirewall, ContainerDriver, ContainerId, ContainerSpec, ExecId, ExecRequest, Firewall,
    RetryPolicy, StopSignal, UnenforcedFirewall,
};
use crate::env::{EnvironmentBuilder, CALLS_SOCKET_VAR};
use crate::error::{DriverError, ExitError, Result, SandboxError};
use crate::mount::{self, MountSpec};
use crate::network::{self, NetworkPolicy};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Container path of the per-session runtime directory
pub const RUNTIME_MOUNT: &str = "/run/sbx";

/// Container path the `sbx` binary is mounted at for `sbx call`
pub const CALL_CLIENT_PATH: &str = "/usr/local/bin/sbx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Stopping,
    Closed,
    Error,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_cancelled(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(SandboxError::Cancelled);
    }
    Ok(())
}

/// Await `op` unless `ctx` is cancelled first
async fn cancellable<T, E, F>(ctx: &CancellationToken, op: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    SandboxError: From<E>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(SandboxError::Cancelled),
        result = op => Ok(result?),
    }
}

/// Everything resolved before a container exists
#[derive(Clone)]
struct Plan {
    config: SandboxConfig,
    policy: ResolvedPolicy,
    mounts: Vec<MountSpec>,
    network: NetworkPolicy,
    gateway: Arc<RemoteCallGateway>,
    driver: Arc<dyn ContainerDriver>,
    firewall: Arc<dyn Firewall>,
    retry: RetryPolicy,
    call_client: Option<PathBuf>,
}

impl Plan {
    fn environment(&self) -> EnvironmentBuilder {
        let mut env = EnvironmentBuilder::new();
        env.pass_through_many(&self.policy.env)
            .set("HOME", &self.policy.home)
            .set("USER", &self.policy.user);
        env
    }

    fn container_spec(&self, mounts: Vec<MountSpec>, env: BTreeMap<String, String>) -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert(
            "sbx.workspace".to_string(),
            self.policy.workspace_root.display().to_string(),
        );
        labels.insert("sbx.resources".to_string(), self.policy.resource_sets.join(","));

        ContainerSpec {
            name: container_name(&self.policy.workspace_root),
            image: self.policy.image.clone(),
            mounts,
            env,
            ports: self.policy.ports.iter().cloned().collect(),
            labels,
            workdir: self.config.working_dir.clone(),
        }
    }

    /// The post-setup command, or an interactive login shell
    fn main_request(&self) -> ExecRequest {
        let (command, tty, stdin, env, workdir) = match &self.config.exec {
            Some(exec) => (
                std::iter::once(exec.command.clone())
                    .chain(exec.args.iter().cloned())
                    .collect(),
                exec.tty,
                false,
                exec.env.clone(),
                exec.workdir.clone(),
            ),
            // Without a TTY the shell reads commands from the caller's stdin
            None => (interactive_shell(), self.config.tty, true, BTreeMap::new(), None),
        };

        ExecRequest {
            user: self.policy.user.clone(),
            workdir: Some(workdir.unwrap_or_else(|| self.config.working_dir.clone())),
            env,
            command,
            tty,
            stdin,
            sinks: self.config.sinks.clone(),
        }
    }
}

fn interactive_shell() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "if command -v bash >/dev/null 2>&1; then exec bash -l; else exec sh -l; fi".to_string(),
    ]
}

fn container_name(workspace: &Path) -> String {
    let base: String = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("sbx-{}-{}-{:08x}", base, std::process::id(), nanos)
}

/// Host-side resources backing the container: the runtime directory and
/// the call gateway server
struct Runtime {
    dir: tempfile::TempDir,
    token: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl Runtime {
    fn start(gateway: Arc<RemoteCallGateway>) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("sbx-").tempdir()?;
        let server = CallServer::bind(&dir.path().join(SOCKET_NAME), gateway)?;
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.serve(token.clone()));
        Ok(Self {
            dir,
            token,
            server: Some(handle),
        })
    }

    async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                tracing::warn!("Call gateway task failed: {}", e);
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Resolves a sandbox invocation and runs it in throwaway containers
pub struct EphemeralRunner {
    plan: Plan,
}

impl EphemeralRunner {
    /// Load the configuration layers and resolve everything. No driver call
    /// is made.
    pub fn new(config: SandboxConfig, driver: Arc<dyn ContainerDriver>) -> Result<Self> {
        let loaded = ConfigLoader::load(&config)?;
        tracing::debug!("Configuration layers: {:?}", loaded.sources);
        Self::from_document(config, &loaded.document, driver)
    }

    /// Resolve against an already loaded document
    pub fn from_document(
        config: SandboxConfig,
        document: &ConfigDocument,
        driver: Arc<dyn ContainerDriver>,
    ) -> Result<Self> {
        let policy = resolve_for(document, &config)?;
        let mounts = mount::plan(&policy, &policy.workspace_root)?;
        let network = network::generate(&policy);
        let gateway = Arc::new(RemoteCallGateway::from_policy(&policy)?);

        let firewall: Arc<dyn Firewall> = match CommandFirewall::new(policy.network_enforcer.clone()) {
            Some(firewall) => Arc::new(firewall),
            None => Arc::new(UnenforcedFirewall),
        };

        if config.verbose {
            policy.log_summary();
        }

        Ok(Self {
            plan: Plan {
                config,
                policy,
                mounts,
                network,
                gateway,
                driver,
                firewall,
                retry: RetryPolicy::default(),
                call_client: None,
            },
        })
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.plan.firewall = firewall;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.plan.retry = retry;
        self
    }

    /// Host binary mounted into the container for `sbx call`
    pub fn with_call_client(mut self, path: PathBuf) -> Self {
        self.plan.call_client = Some(path);
        self
    }

    pub fn policy(&self) -> &ResolvedPolicy {
        &self.plan.policy
    }

    pub fn mounts(&self) -> &[MountSpec] {
        &self.plan.mounts
    }

    pub fn network_policy(&self) -> &NetworkPolicy {
        &self.plan.network
    }

    /// A session in the `Created` state; nothing exists on the driver side yet
    pub fn prepare(&self) -> Session {
        Session::new(Arc::new(self.plan.clone()))
    }

    /// Create and start a session. On failure whatever was created is closed
    /// before the error is returned.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<Session> {
        let mut session = self.prepare();
        if let Err(e) = session.start(ctx).await {
            if let Err(close_err) = session.close().await {
                tracing::warn!("Failed to clean up after start failure: {}", close_err);
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Start, wait for exit or cancellation, then close
    ///
    /// A non-zero exit of the command is returned as [`SandboxError::Exit`].
    pub async fn run(&self, ctx: &CancellationToken) -> Result<()> {
        let mut session = self.prepare();
        let result = Self::drive(&mut session, ctx).await;
        if let Err(e) = session.close().await {
            tracing::warn!("Failed to clean up sandbox: {}", e);
        }
        result
    }

    async fn drive(session: &mut Session, ctx: &CancellationToken) -> Result<()> {
        session.start(ctx).await?;
        match session.wait(ctx).await {
            Err(SandboxError::Cancelled) => {
                // The grace period is not bounded by the cancelled context
                session.stop(&CancellationToken::new()).await?;
                Err(SandboxError::Cancelled)
            }
            other => other,
        }
    }
}

/// One live container
///
/// `wait`, `stop` and `close` take `&self` and may be called concurrently
/// and repeatedly.
pub struct Session {
    plan: Arc<Plan>,
    state: Mutex<SessionState>,
    container: Option<ContainerId>,
    main: Option<ExecId>,
    exit: Mutex<Option<i64>>,
    runtime: Mutex<Option<Runtime>>,
    stopped: tokio::sync::Mutex<bool>,
    closed: tokio::sync::Mutex<bool>,
}

impl Session {
    fn new(plan: Arc<Plan>) -> Self {
        Self {
            plan,
            state: Mutex::new(SessionState::Created),
            container: None,
            main: None,
            exit: Mutex::new(None),
            runtime: Mutex::new(None),
            stopped: tokio::sync::Mutex::new(false),
            closed: tokio::sync::Mutex::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        tracing::debug!("Session state {:?} -> {:?}", *current, state);
        *current = state;
    }

    /// Exit status of the main process, once observed
    pub fn exit_code(&self) -> Option<i64> {
        *lock(&self.exit)
    }

    /// Create the container, install the network policy, bootstrap the user
    /// and attach the main process. Returns once it is running.
    pub async fn start(&mut self, ctx: &CancellationToken) -> Result<()> {
        if self.state() != SessionState::Created {
            return Err(DriverError::fatal("start", "session was already started").into());
        }

        self.set_state(SessionState::Starting);
        match self.start_container(ctx).await {
            Ok(()) => {
                self.set_state(SessionState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                Err(e)
            }
        }
    }

    async fn start_container(&mut self, ctx: &CancellationToken) -> Result<()> {
        let plan = self.plan.clone();
        let mut mounts = plan.mounts.clone();
        let mut env = plan.environment();

        if !plan.gateway.is_empty() {
            let runtime = Runtime::start(plan.gateway.clone())?;
            mounts.push(MountSpec::ro(runtime.dir.path(), Path::new(RUNTIME_MOUNT)));
            if let Some(client) = &plan.call_client {
                mounts.push(MountSpec::ro(client.as_path(), Path::new(CALL_CLIENT_PATH)));
            }
            env.set(CALLS_SOCKET_VAR, format!("{}/{}", RUNTIME_MOUNT, SOCKET_NAME));
            *lock(&self.runtime) = Some(runtime);
        }
        check_cancelled(ctx)?;

        // Creation failures are never retried. A create cancelled in flight
        // may still complete, so cleanup falls back to the container name.
        let spec = plan.container_spec(mounts, env.build());
        let id = match cancellable(ctx, plan.driver.create(&spec)).await {
            Ok(id) => id,
            Err(SandboxError::Cancelled) => {
                self.container = Some(ContainerId(spec.name.clone()));
                return Err(SandboxError::Cancelled);
            }
            Err(e) => return Err(e),
        };
        tracing::debug!("Created container {} ({})", id, spec.name);
        self.container = Some(id.clone());

        cancellable(ctx, plan.driver.start(&id)).await?;
        cancellable(ctx, plan.firewall.install(&id, &plan.network)).await?;

        let bootstrap = Bootstrap::for_policy(&plan.policy, plan.config.host);
        cancellable(ctx, bootstrap.run(plan.driver.as_ref(), &id, plan.retry)).await?;

        let exec = cancellable(ctx, plan.driver.exec(&id, &plan.main_request())).await?;
        tracing::debug!("Attached {} in {}", exec, id);
        self.main = Some(exec);
        Ok(())
    }

    async fn exit_status(&self) -> Result<i64> {
        let cached = *lock(&self.exit);
        if let Some(code) = cached {
            return Ok(code);
        }

        let exec = self
            .main
            .as_ref()
            .ok_or_else(|| DriverError::fatal("wait", "session has no running process"))?;
        let driver = &self.plan.driver;
        let code = self.plan.retry.run(|| driver.wait(exec)).await?;

        *lock(&self.exit) = Some(code);
        Ok(code)
    }

    /// Block until the main process exits or `ctx` is cancelled
    ///
    /// Cancellation returns [`SandboxError::Cancelled`] and leaves the
    /// container running.
    pub async fn wait(&self, ctx: &CancellationToken) -> Result<()> {
        let code = match cancellable(ctx, self.exit_status()).await {
            Ok(code) => code,
            Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(e) => {
                self.set_state(SessionState::Error);
                return Err(e);
            }
        };

        if code != 0 {
            return Err(ExitError { code }.into());
        }
        Ok(())
    }

    /// Send the graceful stop signal, then force kill after the stop timeout
    /// or as soon as `ctx` is cancelled
    pub async fn stop(&self, ctx: &CancellationToken) -> Result<()> {
        let Some(id) = self.container.as_ref() else {
            return Ok(());
        };

        let mut stopped = self.stopped.lock().await;
        if *stopped || self.state() == SessionState::Closed {
            return Ok(());
        }
        self.set_state(SessionState::Stopping);

        if let Err(e) = self.signal_stop(id, ctx).await {
            self.set_state(SessionState::Error);
            return Err(e);
        }

        *stopped = true;
        Ok(())
    }

    async fn signal_stop(&self, id: &ContainerId, ctx: &CancellationToken) -> Result<()> {
        let driver = &self.plan.driver;
        let retry = self.plan.retry;
        retry.run(|| driver.stop(id, StopSignal::Graceful)).await?;

        let timeout = self.plan.config.stop_timeout;
        let exited = match &self.main {
            Some(_) => tokio::select! {
                _ = ctx.cancelled() => false,
                result = tokio::time::timeout(timeout, self.exit_status()) => {
                    matches!(result, Ok(Ok(_)))
                }
            },
            None => false,
        };

        if !exited {
            tracing::debug!("Container {} still running after {:?}, killing", id, timeout);
            retry.run(|| driver.stop(id, StopSignal::Kill)).await?;
        }
        Ok(())
    }

    /// Remove the container and release host resources
    ///
    /// Succeeds trivially on a session that never created a container.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }

        let removed = match &self.container {
            Some(id) => {
                let driver = &self.plan.driver;
                self.plan.retry.run(|| driver.remove(id)).await
            }
            None => Ok(()),
        };

        let runtime = lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            runtime.shutdown().await;
        }

        if let Err(e) = removed {
            self.set_state(SessionState::Error);
            return Err(e.into());
        }

        *closed = true;
        self.set_state(SessionState::Closed);
        Ok(())
    }
}
