//! In-container user setup, run as root before the agent command

use crate::config::{HostIdentity, OutputSink, OutputSinks, ResolvedPolicy, SharedBuffer};
use crate::driver::{ContainerDriver, ContainerId, ExecRequest, RetryPolicy};
use crate::error::DriverError;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Positional parameters: user, uid, gid, home, workspace
const SCRIPT: &str = r#"set -eu
user="$1"; uid="$2"; gid="$3"; home="$4"; workspace="$5"
if [ "$user" != root ]; then
    if ! getent group "$gid" >/dev/null 2>&1; then
        if getent group "$user" >/dev/null 2>&1; then
            groupmod -o -g "$gid" "$user"
        else
            groupadd -o -g "$gid" "$user"
        fi
    fi
    if id -u "$user" >/dev/null 2>&1; then
        usermod -o -u "$uid" -g "$gid" -d "$home" "$user"
    else
        useradd -o -u "$uid" -g "$gid" -d "$home" -M -s /bin/sh "$user"
    fi
fi
mkdir -p "$home"
[ "$user" = root ] || chown "$uid:$gid" "$home"
dir="$workspace"
while [ "$dir" != / ] && [ -n "$dir" ]; do
    dir=$(dirname "$dir")
    chmod o+x "$dir" 2>/dev/null || true
done
"#;

/// Aligns the in-container user with the host user so files written to
/// writable mounts keep the host owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub user: String,
    pub home: String,
    pub uid: u32,
    pub gid: u32,
    pub workspace: PathBuf,
}

impl Bootstrap {
    pub fn for_policy(policy: &ResolvedPolicy, host: HostIdentity) -> Self {
        Self {
            user: policy.user.clone(),
            home: policy.home.clone(),
            uid: host.uid,
            gid: host.gid,
            workspace: policy.workspace_root.clone(),
        }
    }

    /// Build the command for the bootstrap exec
    pub fn command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            SCRIPT.to_string(),
            "sbx-bootstrap".to_string(),
            self.user.clone(),
            self.uid.to_string(),
            self.gid.to_string(),
            self.home.clone(),
            self.workspace.display().to_string(),
        ]
    }

    /// Run the bootstrap inside a started container
    pub async fn run(
        &self,
        driver: &dyn ContainerDriver,
        id: &ContainerId,
        retry: RetryPolicy,
    ) -> Result<(), DriverError> {
        let stderr = SharedBuffer::new();
        let request = ExecRequest {
            user: "root".to_string(),
            workdir: Some(PathBuf::from("/")),
            env: BTreeMap::new(),
            command: self.command(),
            tty: false,
            stdin: false,
            sinks: OutputSinks {
                stdout: OutputSink::Null,
                stderr: OutputSink::Buffer(stderr.clone()),
            },
        };

        tracing::debug!("Bootstrapping user {} ({}:{})", self.user, self.uid, self.gid);
        let exec = driver.exec(id, &request).await?;
        let code = retry.run(|| driver.wait(&exec)).await?;
        if code != 0 {
            return Err(DriverError::fatal(
                "bootstrap",
                format!(
                    "user setup exited with status {}: {}",
                    code,
                    stderr.to_string_lossy().trim()
                ),
            ));
        }
        Ok(())
    }
}
