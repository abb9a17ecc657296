//! Docker/podman CLI driver

use super::{ContainerDriver, ContainerId, ContainerSpec, DriverResult, ExecId, ExecRequest, StopSignal};
use crate::config::{OutputSink, SharedBuffer};
use crate::error::DriverError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;

type ExitState = Option<Result<i64, String>>;

/// Substrings of runtime stderr that indicate a retryable condition
const TRANSIENT_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "connection refused",
    "i/o timeout",
    "context deadline exceeded",
    "resource temporarily unavailable",
];

const GONE_MARKERS: &[&str] = &["No such container", "no such container", "is not running"];

/// Drives a container runtime through its command-line interface
pub struct DockerDriver {
    runtime: String,
    execs: Mutex<HashMap<ExecId, watch::Receiver<ExitState>>>,
    next_exec: AtomicU64,
}

impl DockerDriver {
    /// `runtime` is the CLI binary, e.g. `docker` or `podman`
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            execs: Mutex::new(HashMap::new()),
            next_exec: AtomicU64::new(1),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.runtime)
    }

    /// Run a short-lived runtime command and return its trimmed stdout
    async fn run(&self, op: &'static str, mut cmd: Command) -> DriverResult<String> {
        tracing::debug!("{} {:?}", op, cmd.as_std());
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DriverError::fatal(op, format!("failed to run {}: {}", self.runtime, e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(op, stderr))
    }

    fn execs(&self) -> std::sync::MutexGuard<'_, HashMap<ExecId, watch::Receiver<ExitState>>> {
        self.execs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn classify(op: &'static str, stderr: String) -> DriverError {
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        DriverError::transient(op, stderr)
    } else {
        DriverError::fatal(op, stderr)
    }
}

fn is_gone(err: &DriverError) -> bool {
    GONE_MARKERS.iter().any(|m| err.message.contains(m))
}

/// Arguments for `create`; values of `spec.env` are passed through the
/// runtime's own environment
pub fn create_args(spec: &ContainerSpec) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["create".into(), "--name".into(), spec.name.clone().into()];

    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value).into());
    }

    for mount in &spec.mounts {
        args.extend(mount.to_args());
    }

    for port in &spec.ports {
        args.push("-p".into());
        args.push(port.to_string().into());
    }

    for key in spec.env.keys() {
        args.push("-e".into());
        args.push(key.into());
    }

    args.push("-w".into());
    args.push(spec.workdir.clone().into());

    // Keep the container alive; work happens through exec
    args.push("--entrypoint".into());
    args.push("sleep".into());
    args.push(spec.image.clone().into());
    args.push("infinity".into());

    args
}

/// Arguments for `stop`
///
/// PID 1 of the container is the keep-alive `sleep`, which does not act on
/// SIGTERM, so the graceful signal goes to every other process through an
/// exec as root. The kill targets PID 1 and takes the whole container down.
pub fn stop_args(id: &ContainerId, signal: StopSignal) -> Vec<OsString> {
    match signal {
        StopSignal::Graceful => vec![
            "exec".into(),
            "-u".into(),
            "root".into(),
            id.0.clone().into(),
            "sh".into(),
            "-c".into(),
            "kill -TERM -1 2>/dev/null; true".into(),
        ],
        StopSignal::Kill => vec![
            "kill".into(),
            "--signal".into(),
            "KILL".into(),
            id.0.clone().into(),
        ],
    }
}

pub fn exec_args(id: &ContainerId, request: &ExecRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["exec".into()];

    if request.tty {
        args.push("-it".into());
    } else if request.stdin {
        args.push("-i".into());
    }

    args.push("-u".into());
    args.push(request.user.clone().into());

    if let Some(dir) = &request.workdir {
        args.push("-w".into());
        args.push(dir.clone().into());
    }

    for key in request.env.keys() {
        args.push("-e".into());
        args.push(key.into());
    }

    args.push(id.0.clone().into());
    args.extend(request.command.iter().map(OsString::from));

    args
}

fn sink_stdio(sink: &OutputSink) -> Stdio {
    match sink {
        OutputSink::Inherit => Stdio::inherit(),
        OutputSink::Null => Stdio::null(),
        OutputSink::Buffer(_) => Stdio::piped(),
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, buffer: SharedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buffer.append(&chunk[..n]),
            Err(e) => {
                tracing::debug!("Output pump stopped: {}", e);
                break;
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i64 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as i64,
        (None, Some(signal)) => 128 + signal as i64,
        (None, None) => -1,
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<ContainerId> {
        let mut cmd = self.command();
        cmd.args(create_args(spec)).envs(&spec.env);
        let id = self.run("create", cmd).await?;
        if id.is_empty() {
            return Err(DriverError::fatal("create", "runtime returned no container id"));
        }
        Ok(ContainerId(id))
    }

    async fn start(&self, id: &ContainerId) -> DriverResult<()> {
        let mut cmd = self.command();
        cmd.arg("start").arg(&id.0);
        self.run("start", cmd).await.map(|_| ())
    }

    async fn exec(&self, id: &ContainerId, request: &ExecRequest) -> DriverResult<ExecId> {
        let mut cmd = self.command();
        cmd.args(exec_args(id, request)).envs(&request.env);

        if request.tty {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(if request.stdin { Stdio::inherit() } else { Stdio::null() })
                .stdout(sink_stdio(&request.sinks.stdout))
                .stderr(sink_stdio(&request.sinks.stderr));
        }

        tracing::debug!("exec {:?}", cmd.as_std());
        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::fatal("exec", format!("failed to run {}: {}", self.runtime, e)))?;

        let mut pumps = Vec::new();
        if let (Some(out), OutputSink::Buffer(buf)) = (child.stdout.take(), &request.sinks.stdout) {
            pumps.push(tokio::spawn(pump(out, buf.clone())));
        }
        if let (Some(err), OutputSink::Buffer(buf)) = (child.stderr.take(), &request.sinks.stderr) {
            pumps.push(tokio::spawn(pump(err, buf.clone())));
        }

        let exec_id = ExecId(format!(
            "{}-exec-{}",
            id.0,
            self.next_exec.fetch_add(1, Ordering::Relaxed)
        ));
        let (tx, rx) = watch::channel(None);
        self.execs().insert(exec_id.clone(), rx);

        tokio::spawn(async move {
            let status = child.wait().await;
            // Drain output before publishing the exit
            for pump in pumps {
                let _ = pump.await;
            }
            let state = status.map(exit_code).map_err(|e| e.to_string());
            let _ = tx.send(Some(state));
        });

        Ok(exec_id)
    }

    async fn wait(&self, exec: &ExecId) -> DriverResult<i64> {
        let mut rx = self
            .execs()
            .get(exec)
            .cloned()
            .ok_or_else(|| DriverError::fatal("wait", format!("unknown exec {}", exec)))?;

        let state = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DriverError::fatal("wait", "exec monitor went away"))?
            .clone();

        match state {
            Some(Ok(code)) => Ok(code),
            Some(Err(message)) => Err(DriverError::fatal("wait", message)),
            None => Err(DriverError::fatal("wait", "exec has no exit status")),
        }
    }

    async fn stop(&self, id: &ContainerId, signal: StopSignal) -> DriverResult<()> {
        let mut cmd = self.command();
        cmd.args(stop_args(id, signal));
        match self.run("stop", cmd).await {
            Err(e) if is_gone(&e) => Ok(()),
            result => result.map(|_| ()),
        }
    }

    async fn remove(&self, id: &ContainerId) -> DriverResult<()> {
        let mut cmd = self.command();
        cmd.arg("rm").arg("-f").arg(&id.0);
        let result = match self.run("remove", cmd).await {
            Err(e) if is_gone(&e) => Ok(()),
            result => result.map(|_| ()),
        };
        self.execs().retain(|exec, _| !exec.0.starts_with(&id.0));
        result
    }
}
