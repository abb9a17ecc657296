//! Container runtime and firewall seams
//!
//! The supervisor talks to the runtime only through [`ContainerDriver`] and
//! to the network enforcer only through [`Firewall`].

pub mod docker;
pub mod firewall;
pub mod recording;

use crate::config::{OutputSinks, PortForward};
use crate::error::DriverError;
use crate::mount::MountSpec;
use crate::network::NetworkPolicy;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

pub use docker::DockerDriver;
pub use firewall::{CommandFirewall, UnenforcedFirewall};
pub use recording::{DriverCall, RecordingDriver};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Runtime identifier of a created container
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of a process started with [`ContainerDriver::exec`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecId(pub String);

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, the process may clean up
    Graceful,
    /// SIGKILL
    Kill,
}

/// Everything the runtime needs to create the container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<MountSpec>,
    /// Environment of the container's init process
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortForward>,
    pub labels: BTreeMap<String, String>,
    pub workdir: PathBuf,
}

/// A process to run inside a started container
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// User name or `uid:gid`
    pub user: String,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub tty: bool,
    /// Attach the caller's stdin without a TTY
    pub stdin: bool,
    /// Destination of stdout/stderr when not attached to a TTY
    pub sinks: OutputSinks,
}

/// Container runtime operations used by the supervisor
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<ContainerId>;

    async fn start(&self, id: &ContainerId) -> DriverResult<()>;

    /// Start a process and attach its streams. Returns once it is running.
    async fn exec(&self, id: &ContainerId, request: &ExecRequest) -> DriverResult<ExecId>;

    /// Exit status of a process. May be called any number of times,
    /// concurrently, before or after the process exits.
    async fn wait(&self, exec: &ExecId) -> DriverResult<i64>;

    async fn stop(&self, id: &ContainerId, signal: StopSignal) -> DriverResult<()>;

    /// Remove the container. Removing a container that is already gone succeeds.
    async fn remove(&self, id: &ContainerId) -> DriverResult<()>;
}

/// Network policy enforcement collaborator
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn install(&self, id: &ContainerId, policy: &NetworkPolicy) -> DriverResult<()>;
}

/// Bounded exponential backoff for transient driver failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Run `op`, retrying while it fails transiently
    pub async fn run<T, F, Fut>(&self, mut op: F) -> DriverResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.transient && attempt < self.attempts => {
                    tracing::debug!(
                        "Transient driver failure (attempt {}/{}): {}",
                        attempt,
                        self.attempts,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
