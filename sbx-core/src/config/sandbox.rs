//! Per-invocation sandbox parameters

use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Directory holding the project configuration, relative to the workspace root
pub const CONFIG_DIR: &str = ".sbx";

/// Configuration file names searched inside [`CONFIG_DIR`], in order
pub const CONFIG_FILES: &[&str] = &["config.yaml", "config.yml", "config.toml"];

/// Time a container gets to exit after the graceful stop signal
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw invocation parameters, as collected from the command line
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Working directory (default: current directory)
    pub working_dir: Option<PathBuf>,
    /// Workspace root (default: the directory containing `.sbx`)
    pub workspace_root: Option<PathBuf>,
    /// Explicit configuration file
    pub config_path: Option<PathBuf>,
    pub vars: BTreeMap<String, String>,
    pub read_write: Vec<PathBuf>,
    pub resource_sets: Vec<String>,
    pub image: Option<String>,
    pub user: Option<String>,
    pub verbose: bool,
    pub exec: Option<ExecSpec>,
    /// Whether the interactive shell gets a TTY
    pub tty: bool,
    pub sinks: OutputSinks,
    pub stop_timeout: Option<Duration>,
}

/// Normalized sandbox configuration. Built once per invocation by
/// [`SandboxOptions::normalize`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Canonical working directory
    pub working_dir: PathBuf,
    /// Canonical workspace root
    pub workspace_root: PathBuf,
    /// Project configuration file (may not exist)
    pub config_path: PathBuf,
    /// Template variables for `${{ vars.* }}`
    pub vars: BTreeMap<String, String>,
    /// Paths to mount read-write, as given (resolved against the working dir)
    pub read_write: Vec<PathBuf>,
    /// Resource sets selected explicitly
    pub resource_sets: Vec<String>,
    pub image: Option<String>,
    pub user: Option<String>,
    pub verbose: bool,
    /// Command to run after bootstrap; `None` starts an interactive shell
    pub exec: Option<ExecSpec>,
    /// Whether the interactive shell gets a TTY
    pub tty: bool,
    pub sinks: OutputSinks,
    pub stop_timeout: Duration,
    pub host: HostIdentity,
}

/// A command to run inside the container after bootstrap
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Environment additions, applied over the policy environment
    pub env: BTreeMap<String, String>,
    /// Working directory inside the container (default: the working dir)
    pub workdir: Option<PathBuf>,
    pub tty: bool,
}

impl ExecSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
            tty: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }
}

/// UID/GID of the user invoking the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl HostIdentity {
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Where the output of a non-TTY command goes
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Share the supervisor's own stream
    #[default]
    Inherit,
    /// Discard
    Null,
    /// Collect into an in-memory buffer
    Buffer(SharedBuffer),
}

#[derive(Debug, Clone, Default)]
pub struct OutputSinks {
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

/// Byte buffer shared between a stream pump and its reader
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(bytes);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl SandboxOptions {
    /// Fill in defaults and canonicalize paths
    pub fn normalize(self) -> Result<SandboxConfig> {
        let working_dir = match self.working_dir {
            Some(dir) => dir,
            None => env::current_dir()?,
        };
        let working_dir = canonical_dir(&working_dir)?;

        let discovered = find_project_config(&working_dir);

        let config_path = match (&self.config_path, &discovered) {
            (Some(explicit), _) => {
                let path = absolute_from(&working_dir, explicit);
                if !path.is_file() {
                    return Err(ConfigError::Load {
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "configuration file not found",
                        ),
                        path,
                    }
                    .into());
                }
                path
            }
            (None, Some(found)) => found.clone(),
            (None, None) => working_dir.join(CONFIG_DIR).join(CONFIG_FILES[0]),
        };

        let workspace_root = match self.workspace_root {
            Some(root) => canonical_dir(&absolute_from(&working_dir, &root))?,
            None => workspace_for_config(&config_path).unwrap_or_else(|| working_dir.clone()),
        };

        Ok(SandboxConfig {
            working_dir,
            workspace_root,
            config_path,
            vars: self.vars,
            read_write: self.read_write,
            resource_sets: self.resource_sets,
            image: self.image,
            user: self.user,
            verbose: self.verbose,
            exec: self.exec,
            tty: self.tty,
            sinks: self.sinks,
            stop_timeout: self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
            host: HostIdentity::current(),
        })
    }
}

impl SandboxConfig {
    /// Override the host identity used for UID/GID alignment
    pub fn with_host(mut self, host: HostIdentity) -> Self {
        self.host = host;
        self
    }

    /// Working directory relative to the workspace root, `/`-separated, empty
    /// for the root itself
    pub fn workspace_rel_path(&self) -> std::result::Result<String, ConfigError> {
        let rel = self
            .working_dir
            .strip_prefix(&self.workspace_root)
            .map_err(|_| ConfigError::WorkdirOutsideWorkspace {
                workdir: self.working_dir.clone(),
                workspace: self.workspace_root.clone(),
            })?;

        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

fn canonical_dir(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Directory does not exist: {}", path.display()),
        )
        .into());
    }
    Ok(path.canonicalize()?)
}

pub(crate) fn absolute_from(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Search up the directory tree for `.sbx/config.*`
pub fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let dir = current.join(CONFIG_DIR);
        if let Some(found) = CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
        {
            return Some(found);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// The workspace owning a config file living in `<root>/.sbx/`
fn workspace_for_config(config_path: &Path) -> Option<PathBuf> {
    let dir = config_path.parent()?;
    if dir.file_name()? != CONFIG_DIR {
        return None;
    }
    dir.parent()?.canonicalize().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_normalize_discovers_project_config() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join(".sbx")).unwrap();
        fs::write(root.join(".sbx/config.yaml"), "image: x\n").unwrap();
        fs::create_dir_all(root.join("frontend/src")).unwrap();

        let config = SandboxOptions {
            working_dir: Some(root.join("frontend/src")),
            ..Default::default()
        }
        .normalize()
        .unwrap();

        assert_eq!(config.workspace_root, root);
        assert_eq!(config.config_path, root.join(".sbx/config.yaml"));
        assert_eq!(config.workspace_rel_path().unwrap(), "frontend/src");
        assert_eq!(config.stop_timeout, DEFAULT_STOP_TIMEOUT);
    }

    #[test]
    fn test_normalize_without_project_config() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();

        let config = SandboxOptions {
            working_dir: Some(root.clone()),
            ..Default::default()
        }
        .normalize()
        .unwrap();

        assert_eq!(config.workspace_root, root);
        assert_eq!(config.config_path, root.join(".sbx/config.yaml"));
        assert_eq!(config.workspace_rel_path().unwrap(), "");
    }

    #[test]
    fn test_workdir_outside_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("ws")).unwrap();
        fs::create_dir_all(root.join("elsewhere")).unwrap();

        let config = SandboxOptions {
            working_dir: Some(root.join("elsewhere")),
            workspace_root: Some(root.join("ws")),
            ..Default::default()
        }
        .normalize()
        .unwrap();

        assert!(matches!(
            config.workspace_rel_path(),
            Err(ConfigError::WorkdirOutsideWorkspace { .. })
        ));
    }

    #[test]
    fn test_shared_buffer() {
        let buf = SharedBuffer::new();
        let writer = buf.clone();
        writer.append(b"hello ");
        writer.append(b"world");
        assert_eq!(buf.to_string_lossy(), "hello world");
    }
}
