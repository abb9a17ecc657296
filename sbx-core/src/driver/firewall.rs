//! Network policy enforcement adapters

use super::{ContainerId, DriverResult, Firewall};
use crate::error::DriverError;
use crate::network::NetworkPolicy;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs an external enforcer with the container id as its last argument and
/// the policy as JSON on stdin
#[derive(Debug, Clone)]
pub struct CommandFirewall {
    command: Vec<String>,
}

impl CommandFirewall {
    pub fn new(command: Vec<String>) -> Option<Self> {
        (!command.is_empty()).then_some(Self { command })
    }
}

#[async_trait]
impl Firewall for CommandFirewall {
    async fn install(&self, id: &ContainerId, policy: &NetworkPolicy) -> DriverResult<()> {
        let payload = serde_json::to_vec(policy)
            .map_err(|e| DriverError::fatal("firewall", e.to_string()))?;

        tracing::debug!("Installing network policy with {:?}", self.command);

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(&id.0)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                DriverError::fatal("firewall", format!("failed to run {}: {}", self.command[0], e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| DriverError::fatal("firewall", e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DriverError::fatal("firewall", e.to_string()))?;

        if !output.status.success() {
            return Err(DriverError::fatal(
                "firewall",
                format!(
                    "{} exited with {}: {}",
                    self.command[0],
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(())
    }
}

/// Accepts every policy without enforcing it
#[derive(Debug, Clone, Default)]
pub struct UnenforcedFirewall;

#[async_trait]
impl Firewall for UnenforcedFirewall {
    async fn install(&self, id: &ContainerId, policy: &NetworkPolicy) -> DriverResult<()> {
        tracing::warn!(
            "No network enforcer configured: policy for {} ({} allowed domains) is advisory",
            id,
            policy.allowed_domains.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn policy() -> NetworkPolicy {
        NetworkPolicy {
            default_deny: true,
            allowed_domains: BTreeSet::from(["github.com".to_string()]),
        }
    }

    #[test]
    fn test_empty_command_has_no_firewall() {
        assert!(CommandFirewall::new(vec![]).is_none());
    }

    #[tokio::test]
    async fn test_command_receives_policy_on_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("policy.json");
        let script = format!("cat > {} && test \"$0\" = abc123", out.display());
        let fw = CommandFirewall::new(vec!["sh".into(), "-c".into(), script]).unwrap();

        fw.install(&ContainerId("abc123".into()), &policy()).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["default_deny"], true);
        assert_eq!(written["allowed_domains"][0], "github.com");
    }

    #[tokio::test]
    async fn test_failing_enforcer_is_an_error() {
        let fw = CommandFirewall::new(vec!["sh".into(), "-c".into(), "cat >/dev/null; exit 4".into()])
            .unwrap();
        let err = fw
            .install(&ContainerId("abc".into()), &policy())
            .await
            .unwrap_err();
        assert!(!err.transient);
        assert_eq!(err.op, "firewall");
    }
}
