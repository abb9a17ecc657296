//! Configuration system for sbx
//!
//! This module handles all configuration:
//! - SandboxConfig: normalized per-invocation parameters
//! - ConfigDocument: the declarative resource sets and apply rules
//! - TemplateContext: `${{ scope.NAME }}` substitution before decoding
//! - resolve: folding the document into a ResolvedPolicy

pub mod loader;
pub mod resolver;
pub mod sandbox;
pub mod schema;
pub mod template;

// Re-export commonly used types
pub use loader::{container_home, ConfigFormat, ConfigLoader, LoadedConfig, DEFAULT_USER};
pub use resolver::{resolve, resolve_for, ResolveRequest, ResolvedMount, ResolvedPolicy};
pub use sandbox::{
    find_project_config, ExecSpec, HostIdentity, OutputSink, OutputSinks, SandboxConfig,
    SandboxOptions, SharedBuffer, CONFIG_DIR, DEFAULT_STOP_TIMEOUT,
};
pub use schema::{
    ApplyRule, CallSpec, ConfigDocument, MountDecl, NetworkConfig, PortForward, Protocol,
    ResourceSet,
};
pub use template::{parse_var, TemplateContext};
