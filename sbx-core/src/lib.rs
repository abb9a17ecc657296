//! Core library for policy-constrained agent sandboxes
//!
//! Resolves the declarative workspace configuration into a per-invocation
//! policy and runs it in ephemeral containers through a pluggable driver.

pub mod args;
pub mod bootstrap;
pub mod calls;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod mount;
pub mod network;
pub mod session;
pub mod signal;

pub use args::CommonArgs;
pub use config::{ResolvedPolicy, SandboxConfig, SandboxOptions};
pub use driver::{ContainerDriver, DockerDriver, RecordingDriver};
pub use error::{Result, SandboxError};
pub use session::{EphemeralRunner, Session, SessionState};
