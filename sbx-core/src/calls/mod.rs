//! Remote call gateway: named host commands the agent may invoke
//!
//! A call is accepted only when its name is declared by an active resource
//! set and its space-joined arguments match the declared pattern in full.
//! Rejected calls never reach the host.

pub mod client;
pub mod server;

use crate::config::{CallSpec, ResolvedPolicy};
use crate::error::{ConfigError, PolicyViolation, Result, SandboxError};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

pub use client::call;
pub use server::{CallRequest, CallResponse, CallServer, ErrorKind};

/// File name of the gateway socket inside the runtime directory
pub const SOCKET_NAME: &str = "calls.sock";

/// Compile an argument pattern so that it must match the whole argument string
pub fn compile_pattern(args: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", args))
}

#[derive(Debug, Clone)]
struct GatewayCall {
    spec: CallSpec,
    pattern: Regex,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteCallGateway {
    calls: BTreeMap<String, GatewayCall>,
    /// Host directory commands run in
    workdir: Option<PathBuf>,
}

impl RemoteCallGateway {
    pub fn from_policy(policy: &ResolvedPolicy) -> std::result::Result<Self, ConfigError> {
        let mut calls = BTreeMap::new();
        for (name, spec) in &policy.calls {
            let pattern = compile_pattern(&spec.args).map_err(|source| {
                ConfigError::InvalidCallPattern {
                    name: name.clone(),
                    source,
                }
            })?;
            calls.insert(
                name.clone(),
                GatewayCall {
                    spec: spec.clone(),
                    pattern,
                },
            );
        }
        Ok(Self {
            calls,
            workdir: Some(policy.workspace_root.clone()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Validate a call without running it
    pub fn check(&self, name: &str, args: &[String]) -> std::result::Result<&CallSpec, PolicyViolation> {
        let call = self
            .calls
            .get(name)
            .ok_or_else(|| PolicyViolation::UnknownCall(name.to_string()))?;

        let joined = args.join(" ");
        if !call.pattern.is_match(&joined) {
            return Err(PolicyViolation::ArgumentsRejected {
                name: name.to_string(),
                args: joined,
            });
        }

        Ok(&call.spec)
    }

    /// Validate and run a call on the host, returning its stdout
    pub async fn invoke(&self, name: &str, args: &[String]) -> Result<String> {
        let spec = self.check(name, args)?;

        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        tracing::debug!("Remote call {}: {:?}", name, cmd.as_std());
        let output = cmd.output().await?;

        if !output.status.success() {
            return Err(SandboxError::CallFailed {
                name: name.to_string(),
                code: output.status.code().map(i64::from).unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
