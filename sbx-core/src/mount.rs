//! Mount planning for the sandbox container

use crate::config::ResolvedPolicy;
use crate::error::ConfigError;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A bind mount in the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    /// Source path on host
    pub source: PathBuf,

    /// Target path in the container
    pub target: PathBuf,

    /// Read-write when set, read-only otherwise
    pub rw: bool,
}

impl MountSpec {
    /// Create a read-only mount
    pub fn ro<P: AsRef<Path>>(source: P, target: P) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
            rw: false,
        }
    }

    /// Create a read-write mount
    pub fn rw<P: AsRef<Path>>(source: P, target: P) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
            rw: true,
        }
    }

    /// Convert this mount to container runtime arguments
    ///
    /// Fields holding a comma or a quote are CSV-quoted.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut fields = vec![
            "type=bind".to_string(),
            mount_field("source", &self.source),
            mount_field("target", &self.target),
        ];
        if !self.rw {
            fields.push("readonly".to_string());
        }
        vec!["--mount".into(), fields.join(",").into()]
    }
}

fn mount_field(key: &str, path: &Path) -> String {
    let field = format!("{}={}", key, path.display());
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field
    }
}

/// Compute the ordered mount list for a resolved policy
///
/// Order: the workspace, resource-set mounts in set order, then one writable
/// bind per `-rw` path. Later mounts shadow earlier ones inside the container,
/// so a writable sub-path wins over the read-only workspace.
pub fn plan(policy: &ResolvedPolicy, workspace_root: &Path) -> Result<Vec<MountSpec>, ConfigError> {
    let mut mounts = Vec::with_capacity(1 + policy.mounts.len() + policy.writable_paths.len());

    mounts.push(MountSpec {
        source: workspace_root.to_path_buf(),
        target: workspace_root.to_path_buf(),
        rw: policy.workspace_writable,
    });

    for mount in &policy.mounts {
        if !mount.source.exists() {
            return Err(ConfigError::MountSourceNotFound(mount.source.clone()));
        }
        mounts.push(MountSpec {
            source: mount.source.clone(),
            target: mount.target.clone(),
            rw: mount.rw,
        });
    }

    for path in &policy.writable_paths {
        mounts.push(MountSpec::rw(path, path));
    }

    Ok(mounts)
}

/// The mount that serves `path` inside the container: the last one whose
/// target contains it
pub fn effective_mount<'a>(mounts: &'a [MountSpec], path: &Path) -> Option<&'a MountSpec> {
    mounts.iter().rev().find(|m| path.starts_with(&m.target))
}
