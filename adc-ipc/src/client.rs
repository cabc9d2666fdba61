use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::message::IpcMessage;
use crate::IpcError;

type Pending = Arc<DashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>>;

/// Client side of the IPC contract: correlates request ids with their
/// responses over a single connection, with a per-call deadline.
pub struct IpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader: tokio::task::JoinHandle<()>,
}

impl IpcClient {
    /// Connect to a module's pipe. The default per-call deadline is 30 s.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(|e| IpcError::Io(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(DashMap::new());
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match IpcMessage::from_line(&line) {
                    Ok(IpcMessage::Response { id, result }) => {
                        if let Some((_, tx)) = reader_pending.remove(&id) {
                            let _ = tx.send(Ok(result));
                        }
                    }
                    Ok(IpcMessage::Error { id, error }) => {
                        if let Some((_, tx)) = reader_pending.remove(&id) {
                            let _ = tx.send(Err(error));
                        }
                    }
                    Ok(IpcMessage::Request { .. }) => {
                        warn!("Unexpected request on client connection");
                    }
                    Err(e) => warn!(error = %e, "Malformed IPC line"),
                }
            }
        });

        Ok(Self {
            writer: Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            call_timeout: Duration::from_secs(30),
            reader,
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Invoke a remote method and await its typed reply.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, IpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let line = IpcMessage::Request {
            id,
            method: method.to_string(),
            args,
        }
        .to_line()
        .map_err(|e| IpcError::Serde(e.to_string()))?;

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending.remove(&id);
                return Err(IpcError::Io(e.to_string()));
            }
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(remote))) => Err(IpcError::Remote(remote)),
            Ok(Err(_)) => Err(IpcError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(IpcError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
