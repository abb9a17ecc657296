//! Client side of the call gateway, used by `sbx call` inside the container

use super::server::{CallRequest, CallResponse};
use std::io;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Send one call and wait for its response
pub async fn call(socket: &Path, name: &str, args: &[String]) -> io::Result<CallResponse> {
    let stream = UnixStream::connect(socket).await?;
    let (reader, mut writer) = stream.into_split();

    let request = CallRequest {
        name: name.to_string(),
        args: args.to_vec(),
    };
    let mut encoded = serde_json::to_vec(&request)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;

    let mut line = String::new();
    let n = BufReader::new(reader).read_line(&mut line).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "call gateway closed the connection",
        ));
    }

    Ok(serde_json::from_str(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let err = call(&tmp.path().join("absent.sock"), "x", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
