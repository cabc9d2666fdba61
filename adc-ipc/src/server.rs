use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use adc_executor::MethodRegistry;

use crate::message::IpcMessage;
use crate::IpcError;

/// Serves a module's method table over a unix domain socket.
///
/// Each accepted client gets its own task; requests on one connection
/// are handled in order and answered with a `response` or `error` line
/// carrying the request id.
pub struct IpcServer {
    path: PathBuf,
    registry: Arc<MethodRegistry>,
    shutdown: CancellationToken,
}

impl IpcServer {
    pub fn new(path: impl Into<PathBuf>, registry: Arc<MethodRegistry>) -> Self {
        Self {
            path: path.into(),
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the socket and run the accept loop in a background task.
    pub fn spawn(self: Arc<Self>) -> Result<tokio::task::JoinHandle<()>, IpcError> {
        // A stale socket file from a previous run would fail the bind.
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IpcError::Io(e.to_string()))?;
        }
        let listener =
            UnixListener::bind(&self.path).map_err(|e| IpcError::Io(e.to_string()))?;
        info!(path = %self.path.display(), "IPC server listening");

        let server = self;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let server = server.clone();
                            tokio::spawn(async move {
                                server.handle_client(stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "IPC accept failed"),
                    },
                }
            }
            let _ = std::fs::remove_file(&server.path);
        }))
    }

    async fn handle_client(&self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) if !line.trim().is_empty() => line,
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "IPC read failed");
                    break;
                }
            };

            let reply = match IpcMessage::from_line(&line) {
                Ok(IpcMessage::Request { id, method, args }) => {
                    debug!(id, method, "IPC request");
                    match self.registry.dispatch(&method, args).await {
                        Ok(result) => IpcMessage::Response { id, result },
                        Err(e) => IpcMessage::Error {
                            id,
                            error: e.to_string(),
                        },
                    }
                }
                Ok(other) => IpcMessage::Error {
                    id: other.id(),
                    error: "expected a request message".into(),
                },
                Err(e) => {
                    warn!(error = %e, "Malformed IPC line");
                    continue;
                }
            };

            let Ok(line) = reply.to_line() else {
                error!("IPC reply serialization failed");
                continue;
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}
