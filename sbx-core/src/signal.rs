//! Process signal handling for a supervising invocation

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Translate process signals into cancellation of `token`
///
/// SIGTERM always cancels. SIGINT cancels only non-interactive runs; in an
/// interactive run it reaches the container shell through the TTY, so the
/// supervisor swallows its own copy.
pub fn spawn_signal_bridge(
    token: CancellationToken,
    interactive: bool,
) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sigterm.recv() => {
                    tracing::debug!("SIGTERM received, stopping sandbox");
                    token.cancel();
                    break;
                }
                _ = sigint.recv() => {
                    if interactive {
                        tracing::debug!("SIGINT forwarded to the container shell");
                    } else {
                        tracing::debug!("SIGINT received, stopping sandbox");
                        token.cancel();
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_exits_when_token_cancelled() {
        let token = CancellationToken::new();
        let handle = spawn_signal_bridge(token.clone(), true).unwrap();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
