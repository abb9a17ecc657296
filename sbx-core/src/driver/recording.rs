//! In-memory driver that records every operation
//!
//! Used by `sbx run --dry-run` and by the supervisor tests. Processes exit
//! according to a script of exit codes; a `None` entry keeps the process
//! running until it is finished explicitly or its container is stopped.

use super::{ContainerDriver, ContainerId, ContainerSpec, DriverResult, ExecId, ExecRequest, StopSignal};
use crate::error::DriverError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Exit status reported for SIGTERM and SIGKILL
const TERM_EXIT: i64 = 128 + 15;
const KILL_EXIT: i64 = 128 + 9;

#[derive(Debug, Clone)]
pub enum DriverCall {
    Create(ContainerSpec),
    Start(ContainerId),
    Exec(ContainerId, ExecRequest),
    Stop(ContainerId, StopSignal),
    Remove(ContainerId),
}

struct ExecState {
    container: ContainerId,
    exit: watch::Sender<Option<i64>>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<DriverCall>,
    containers: u32,
    execs: HashMap<ExecId, ExecState>,
    order: Vec<ExecId>,
    exits: VecDeque<Option<i64>>,
}

pub struct RecordingDriver {
    inner: Mutex<Inner>,
    default_exit: Option<i64>,
    fail_create: bool,
    honor_graceful: bool,
    wait_failures: AtomicU32,
    stop_failures: AtomicU32,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDriver {
    /// Every process exits with status 0 as soon as it starts
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            default_exit: Some(0),
            fail_create: false,
            honor_graceful: true,
            wait_failures: AtomicU32::new(0),
            stop_failures: AtomicU32::new(0),
        }
    }

    /// Exit statuses for successive execs; `None` keeps that process running
    pub fn with_exits<I: IntoIterator<Item = Option<i64>>>(self, exits: I) -> Self {
        self.lock().exits = exits.into_iter().collect();
        self
    }

    /// Status of execs past the end of the script
    pub fn with_default_exit(mut self, exit: Option<i64>) -> Self {
        self.default_exit = exit;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Processes keep running through SIGTERM and only exit on SIGKILL
    pub fn ignoring_graceful_stop(mut self) -> Self {
        self.honor_graceful = false;
        self
    }

    /// The next `n` waits fail transiently
    pub fn with_transient_wait_failures(self, n: u32) -> Self {
        self.fail_next_waits(n);
        self
    }

    /// Make the next `n` waits of an already running scenario fail transiently
    pub fn fail_next_waits(&self, n: u32) {
        self.wait_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` stop requests fail transiently and are not recorded
    pub fn with_transient_stop_failures(self, n: u32) -> Self {
        self.stop_failures.store(n, Ordering::SeqCst);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    pub fn create_count(&self) -> usize {
        self.count(|c| matches!(c, DriverCall::Create(_)))
    }

    pub fn remove_count(&self) -> usize {
        self.count(|c| matches!(c, DriverCall::Remove(_)))
    }

    pub fn stop_signals(&self) -> Vec<StopSignal> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                DriverCall::Stop(_, signal) => Some(*signal),
                _ => None,
            })
            .collect()
    }

    pub fn execs(&self) -> Vec<ExecRequest> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                DriverCall::Exec(_, request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn created_spec(&self) -> Option<ContainerSpec> {
        self.lock().calls.iter().find_map(|c| match c {
            DriverCall::Create(spec) => Some(spec.clone()),
            _ => None,
        })
    }

    fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Make the most recent exec exit with `code`
    pub fn finish_last(&self, code: i64) {
        let inner = self.lock();
        if let Some(state) = inner.order.last().and_then(|id| inner.execs.get(id)) {
            publish(&state.exit, code);
        }
    }

    fn signal_container(inner: &Inner, id: &ContainerId, code: i64) {
        for state in inner.execs.values().filter(|s| &s.container == id) {
            publish(&state.exit, code);
        }
    }
}

/// Consume one injected failure, if any are left
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Record the first exit status only
fn publish(exit: &watch::Sender<Option<i64>>, code: i64) {
    exit.send_if_modified(|state| match state {
        Some(_) => false,
        None => {
            *state = Some(code);
            true
        }
    });
}

#[async_trait]
impl ContainerDriver for RecordingDriver {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<ContainerId> {
        let mut inner = self.lock();
        inner.calls.push(DriverCall::Create(spec.clone()));
        if self.fail_create {
            return Err(DriverError::fatal("create", format!("image {} not found", spec.image)));
        }
        inner.containers += 1;
        Ok(ContainerId(format!("recorded-{}", inner.containers)))
    }

    async fn start(&self, id: &ContainerId) -> DriverResult<()> {
        self.lock().calls.push(DriverCall::Start(id.clone()));
        Ok(())
    }

    async fn exec(&self, id: &ContainerId, request: &ExecRequest) -> DriverResult<ExecId> {
        let mut inner = self.lock();
        inner.calls.push(DriverCall::Exec(id.clone(), request.clone()));

        let exit = inner.exits.pop_front().unwrap_or(self.default_exit);
        let exec_id = ExecId(format!("{}-exec-{}", id, inner.order.len() + 1));
        let (tx, _) = watch::channel(exit);
        inner.execs.insert(
            exec_id.clone(),
            ExecState {
                container: id.clone(),
                exit: tx,
            },
        );
        inner.order.push(exec_id.clone());
        Ok(exec_id)
    }

    async fn wait(&self, exec: &ExecId) -> DriverResult<i64> {
        let mut rx = self
            .lock()
            .execs
            .get(exec)
            .map(|s| s.exit.subscribe())
            .ok_or_else(|| DriverError::fatal("wait", format!("unknown exec {}", exec)))?;

        if take_failure(&self.wait_failures) {
            return Err(DriverError::transient("wait", "runtime connection reset"));
        }

        let code = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DriverError::fatal("wait", "driver dropped"))?
            .unwrap_or(KILL_EXIT);
        Ok(code)
    }

    async fn stop(&self, id: &ContainerId, signal: StopSignal) -> DriverResult<()> {
        if take_failure(&self.stop_failures) {
            return Err(DriverError::transient("stop", "runtime connection reset"));
        }
        let mut inner = self.lock();
        inner.calls.push(DriverCall::Stop(id.clone(), signal));
        match signal {
            StopSignal::Graceful if self.honor_graceful => Self::signal_container(&inner, id, TERM_EXIT),
            StopSignal::Graceful => {}
            StopSignal::Kill => Self::signal_container(&inner, id, KILL_EXIT),
        }
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> DriverResult<()> {
        let mut inner = self.lock();
        inner.calls.push(DriverCall::Remove(id.clone()));
        Self::signal_container(&inner, id, KILL_EXIT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputSinks;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "t".into(),
            image: "img".into(),
            mounts: vec![],
            env: BTreeMap::new(),
            ports: vec![],
            labels: BTreeMap::new(),
            workdir: PathBuf::from("/"),
        }
    }

    fn request() -> ExecRequest {
        ExecRequest {
            user: "agent".into(),
            workdir: None,
            env: BTreeMap::new(),
            command: vec!["true".into()],
            tty: false,
            stdin: false,
            sinks: OutputSinks::default(),
        }
    }

    #[tokio::test]
    async fn test_scripted_exits() {
        let driver = RecordingDriver::new().with_exits([Some(0), Some(3)]);
        let id = driver.create(&spec()).await.unwrap();
        let first = driver.exec(&id, &request()).await.unwrap();
        let second = driver.exec(&id, &request()).await.unwrap();
        assert_eq!(driver.wait(&first).await.unwrap(), 0);
        assert_eq!(driver.wait(&second).await.unwrap(), 3);
        // Waiting again reports the same status
        assert_eq!(driver.wait(&second).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stop_signals() {
        let driver = RecordingDriver::new()
            .with_default_exit(None)
            .ignoring_graceful_stop();
        let id = driver.create(&spec()).await.unwrap();
        let exec = driver.exec(&id, &request()).await.unwrap();

        driver.stop(&id, StopSignal::Graceful).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), driver.wait(&exec)).await;
        assert!(pending.is_err());

        driver.stop(&id, StopSignal::Kill).await.unwrap();
        assert_eq!(driver.wait(&exec).await.unwrap(), KILL_EXIT);
        assert_eq!(driver.stop_signals(), vec![StopSignal::Graceful, StopSignal::Kill]);
    }

    #[tokio::test]
    async fn test_finish_last() {
        let driver = RecordingDriver::new().with_default_exit(None);
        let id = driver.create(&spec()).await.unwrap();
        let exec = driver.exec(&id, &request()).await.unwrap();
        driver.finish_last(5);
        assert_eq!(driver.wait(&exec).await.unwrap(), 5);
        // First exit wins
        driver.finish_last(9);
        assert_eq!(driver.wait(&exec).await.unwrap(), 5);
    }
}
