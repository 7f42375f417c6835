//! Relay channel from a secondary launch to the primary instance.
//!
//! Unix domain socket on Unix, named pipe on Windows. One message type: the
//! launch URI as a single UTF-8 line.

use std::fmt;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{CaptureError, Result};

/// Largest relayed message accepted.
const MAX_MESSAGE_BYTES: u64 = 8 * 1024;

/// Where the primary listens for relayed URIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcAddress {
    #[cfg(unix)]
    path: std::path::PathBuf,
    #[cfg(windows)]
    pipe_name: String,
}

impl IpcAddress {
    /// Address derived from the application identity.
    #[cfg_attr(windows, allow(unused_variables))]
    pub fn for_app(runtime_dir: &Path, app_id: &str) -> Self {
        #[cfg(unix)]
        {
            Self {
                path: runtime_dir.join(format!("{}.sock", app_id)),
            }
        }
        #[cfg(windows)]
        {
            Self {
                pipe_name: format!(r"\\.\pipe\{}-{}-oauth", app_id, super::user_name()),
            }
        }
    }
}

impl fmt::Display for IpcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(unix)]
        {
            write!(f, "{}", self.path.display())
        }
        #[cfg(windows)]
        {
            write!(f, "{}", self.pipe_name)
        }
    }
}

/// Listening end, owned by the primary instance.
#[derive(Debug)]
pub struct IpcEndpoint {
    address: IpcAddress,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    server: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl IpcEndpoint {
    /// Open the endpoint. Callers must hold the instance lock, since any
    /// leftover socket file is removed first.
    #[cfg(unix)]
    pub fn bind(address: IpcAddress) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = address.path.parent() {
            super::instance::create_private_dir(parent)?;
        }
        match std::fs::remove_file(&address.path) {
            Ok(()) => tracing::debug!(path = %address, "Removed stale relay socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = tokio::net::UnixListener::bind(&address.path)
            .map_err(|e| CaptureError::Ipc(format!("failed to bind {}: {}", address, e)))?;
        std::fs::set_permissions(&address.path, std::fs::Permissions::from_mode(0o600))?;

        tracing::debug!(path = %address, "Relay endpoint listening");
        Ok(Self { address, listener })
    }

    #[cfg(windows)]
    pub fn bind(address: IpcAddress) -> Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(true)
            .create(&address.pipe_name)
            .map_err(|e| CaptureError::Ipc(format!("failed to create {}: {}", address, e)))?;

        tracing::debug!(pipe = %address, "Relay endpoint listening");
        Ok(Self { address, server })
    }

    pub fn address(&self) -> &IpcAddress {
        &self.address
    }

    /// Wait for one relayed message.
    #[cfg(unix)]
    pub async fn recv_one(&mut self) -> Result<String> {
        let (stream, _) = self.listener.accept().await?;
        read_message(stream).await
    }

    #[cfg(windows)]
    pub async fn recv_one(&mut self) -> Result<String> {
        self.server.connect().await?;
        read_message(&mut self.server).await
    }
}

#[cfg(unix)]
impl Drop for IpcEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.address.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, path = %self.address, "Failed to remove relay socket");
        }
    }
}

async fn read_message<R: AsyncRead + Unpin>(reader: R) -> Result<String> {
    let mut reader = BufReader::new(reader.take(MAX_MESSAGE_BYTES));
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| CaptureError::Ipc(format!("failed to read relayed message: {}", e)))?;
    Ok(line.trim().to_string())
}

/// Send `message` to the primary listening at `address`.
#[cfg(unix)]
pub async fn send(address: &IpcAddress, message: &str) -> Result<()> {
    let mut stream = tokio::net::UnixStream::connect(&address.path)
        .await
        .map_err(|e| CaptureError::Ipc(format!("no primary instance at {}: {}", address, e)))?;
    write_message(&mut stream, message).await
}

#[cfg(windows)]
pub async fn send(address: &IpcAddress, message: &str) -> Result<()> {
    use std::time::Duration;
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    let mut attempts = 0;
    let mut client = loop {
        match ClientOptions::new().open(&address.pipe_name) {
            Ok(client) => break client,
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                return Err(CaptureError::Ipc(format!(
                    "no primary instance at {}: {}",
                    address, e
                )));
            }
        }
    };
    write_message(&mut client, message).await
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> Result<()> {
    let line = format!("{}\n", message.trim());
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    let _ = writer.shutdown().await;
    Ok(())
}
