//! Unix-socket server side of the call gateway
//!
//! One JSON request per line, answered by one JSON response line.

use super::RemoteCallGateway;
use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One line of JSON sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The gateway rejected the call
    Policy,
    /// The host command ran and failed
    Failed,
    /// Malformed request or host-side I/O failure
    Internal,
}

/// One line of JSON sent back for each request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Exit status of a failed host command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl CallResponse {
    fn success(output: String) -> Self {
        Self {
            ok: true,
            output: Some(output),
            error: None,
            kind: None,
            code: None,
        }
    }

    fn failure(kind: ErrorKind, error: String, code: Option<i64>) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error),
            kind: Some(kind),
            code,
        }
    }
}

/// Serves the gateway over a unix socket for the lifetime of a session
pub struct CallServer {
    socket_path: PathBuf,
    listener: UnixListener,
    gateway: Arc<RemoteCallGateway>,
}

impl CallServer {
    /// Bind the socket. Must be called inside a tokio runtime.
    pub fn bind(socket_path: &Path, gateway: Arc<RemoteCallGateway>) -> std::io::Result<Self> {
        // Remove a stale socket left by a previous run
        let _ = std::fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path)?;
        info!("Call gateway listening on {:?}", socket_path);

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            gateway,
        })
    }

    /// Accept connections until `token` is cancelled
    pub async fn serve(self, token: CancellationToken) {
        loop {
            let socket = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        warn!("Call gateway accept failed: {}", e);
                        continue;
                    }
                },
            };

            let gateway = self.gateway.clone();
            let token = token.clone();

            // Spawn a task for each connection
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = handle_client(socket, gateway) => {
                        if let Err(e) = result {
                            debug!("Call client error: {}", e);
                        }
                    }
                }
            });
        }

        let _ = std::fs::remove_file(&self.socket_path);
        debug!("Call gateway stopped");
    }
}

/// Answer requests on one connection, one JSON line each, until EOF
async fn handle_client(stream: UnixStream, gateway: Arc<RemoteCallGateway>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&gateway, &line).await;
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn respond(gateway: &RemoteCallGateway, line: &str) -> CallResponse {
    let request: CallRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return CallResponse::failure(ErrorKind::Internal, format!("invalid request: {}", e), None)
        }
    };

    match gateway.invoke(&request.name, &request.args).await {
        Ok(output) => CallResponse::success(output),
        Err(e) => {
            let (kind, code) = match &e {
                SandboxError::PolicyViolation(_) => (ErrorKind::Policy, None),
                SandboxError::CallFailed { code, .. } => (ErrorKind::Failed, Some(*code)),
                _ => (ErrorKind::Internal, None),
            };
            if kind == ErrorKind::Policy {
                warn!("Rejected remote call: {}", e);
            }
            CallResponse::failure(kind, e.to_string(), code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::{call, GatewayCall};
    use crate::config::CallSpec;
    use std::collections::BTreeMap;

    fn gateway() -> Arc<RemoteCallGateway> {
        let spec = CallSpec {
            name: "greet".into(),
            command: vec!["echo".into(), "hi".into()],
            args: "[a-z]+".into(),
            description: None,
        };
        let mut calls = BTreeMap::new();
        calls.insert(
            "greet".to_string(),
            GatewayCall {
                pattern: crate::calls::compile_pattern(&spec.args).unwrap(),
                spec,
            },
        );
        Arc::new(RemoteCallGateway {
            calls,
            workdir: None,
        })
    }

    #[tokio::test]
    async fn test_serves_calls_and_survives_rejections() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("calls.sock");
        let server = CallServer::bind(&socket, gateway()).unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.serve(token.clone()));

        let rejected = call(&socket, "rm", &["-rf".to_string()]).await.unwrap();
        assert!(!rejected.ok);
        assert_eq!(rejected.kind, Some(ErrorKind::Policy));

        let denied_args = call(&socket, "greet", &["BOB".to_string()]).await.unwrap();
        assert_eq!(denied_args.kind, Some(ErrorKind::Policy));

        let ok = call(&socket, "greet", &["bob".to_string()]).await.unwrap();
        assert!(ok.ok);
        assert_eq!(ok.output.as_deref(), Some("hi bob\n"));

        token.cancel();
        handle.await.unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let gw = gateway();
        let response = respond(&gw, "not json").await;
        assert_eq!(response.kind, Some(ErrorKind::Internal));
    }

    #[test]
    fn test_response_wire_format() {
        let ok = serde_json::to_string(&CallResponse::success("x".into())).unwrap();
        assert_eq!(ok, r#"{"ok":true,"output":"x"}"#);

        let err = CallResponse::failure(ErrorKind::Failed, "boom".into(), Some(2));
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"ok":false,"error":"boom","kind":"failed","code":2}"#
        );
    }
}
