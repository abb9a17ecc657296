//! Error types for sandbox operations

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Top-level error returned by every public sandbox operation
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    #[error(transparent)]
    Exit(#[from] ExitError),

    #[error("Remote call '{name}' failed with status {code}: {stderr}")]
    CallFailed {
        name: String,
        code: i64,
        stderr: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed or inconsistent declarative input. Always raised before any
/// container exists.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config from {path}: {source}")]
    Load {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Unknown resource set '{name}' referenced by {referrer}")]
    UnknownResourceSet { name: String, referrer: String },

    #[error(
        "Conflicting mounts for container path {target}: {first} and {second}"
    )]
    MountConflict {
        target: PathBuf,
        first: String,
        second: String,
    },

    #[error("Mount target '{0}' must be an absolute container path")]
    RelativeMountTarget(String),

    #[error("Mount source does not exist: {0}")]
    MountSourceNotFound(PathBuf),

    #[error("Read-write path does not exist: {0}")]
    RwPathNotFound(PathBuf),

    #[error("Read-write path {path} is outside the workspace {workspace}")]
    RwOutsideWorkspace { path: PathBuf, workspace: PathBuf },

    #[error("Working directory {workdir} is outside the workspace {workspace}")]
    WorkdirOutsideWorkspace { workdir: PathBuf, workspace: PathBuf },

    #[error("Template variable '{scope}.{key}' is referenced but not supplied")]
    MissingTemplateKey { scope: String, key: String },

    #[error("Malformed template in '{text}': {reason}")]
    MalformedTemplate { text: String, reason: String },

    #[error("Invalid apply rule path '{0}': must be relative to the workspace root")]
    InvalidRulePath(String),

    #[error("Invalid domain pattern '{domain}' in resource set '{set}'")]
    InvalidDomain { domain: String, set: String },

    #[error("Invalid port forward '{0}'")]
    InvalidPort(String),

    #[error("Host port {port} is forwarded to both {first} and {second}")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },

    #[error("Remote call '{0}' is defined differently by two resource sets")]
    CallConflict(String),

    #[error("Invalid argument pattern for remote call '{name}': {source}")]
    InvalidCallPattern {
        name: String,
        source: regex::Error,
    },

    #[error("Remote call '{0}' has an empty command")]
    EmptyCallCommand(String),

    #[error("No image configured: set a top-level image, an apply rule image, or pass --image")]
    MissingImage,

    #[error("Invalid template variable '{0}': expected KEY=VALUE")]
    InvalidVar(String),

    #[error("Environment variable {0} not found")]
    EnvVarNotFound(String),
}

/// The container runtime was unreachable or one of its operations failed
#[derive(Debug, Error)]
#[error("Container driver {op} failed: {message}")]
pub struct DriverError {
    pub op: &'static str,
    pub message: String,
    /// Transient failures are retried during wait/stop
    pub transient: bool,
}

impl DriverError {
    pub fn fatal(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
            transient: true,
        }
    }
}

/// A remote call was rejected by the gateway; the host command never ran
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyViolation {
    #[error("Remote call '{0}' is not declared by the active policy")]
    UnknownCall(String),

    #[error("Arguments {args:?} are not permitted for remote call '{name}'")]
    ArgumentsRejected { name: String, args: String },
}

/// The command inside the container exited with a non-zero status
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Command exited with status {code}")]
pub struct ExitError {
    pub code: i64,
}
