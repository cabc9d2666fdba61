//! Cross-language IPC for the ADC platform.
//!
//! One JSON message per line over a local duplex pipe (a unix domain
//! socket; a named pipe fills the same role on Windows). Requests carry
//! `{id, type:"request", method, args}`; replies are `response` or
//! `error` lines with the same id. Binary payloads travel as
//! `{"__type":"Buffer","data":"<base64>"}` envelopes.
//!
//! The server dispatches into an [`adc_executor::MethodRegistry`], so a
//! module's method table serves local workers and external processes
//! alike.

pub mod message;
#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;

pub use message::{decode_buffer, encode_buffer, is_buffer, pipe_path, IpcMessage};
#[cfg(unix)]
pub use client::IpcClient;
#[cfg(unix)]
pub use server::IpcServer;

use std::fmt;

/// Errors raised by the IPC transport.
#[derive(Debug)]
pub enum IpcError {
    Io(String),
    Serde(String),
    /// The remote side answered with an `error` message.
    Remote(String),
    /// The per-call deadline elapsed.
    Timeout { method: String },
    /// The connection closed before a reply arrived.
    ConnectionClosed,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::Io(msg) => write!(f, "IPC I/O error: {msg}"),
            IpcError::Serde(msg) => write!(f, "IPC serialization error: {msg}"),
            IpcError::Remote(msg) => write!(f, "Remote error: {msg}"),
            IpcError::Timeout { method } => {
                write!(f, "IPC call '{method}' exceeded its deadline")
            }
            IpcError::ConnectionClosed => write!(f, "IPC connection closed"),
        }
    }
}

impl std::error::Error for IpcError {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use adc_executor::{ExecutorError, MethodRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    fn echo_registry() -> Arc<MethodRegistry> {
        Arc::new(
            MethodRegistry::new()
                .register("echo", |args| async move {
                    Ok(serde_json::Value::Array(args))
                })
                .register("fail", |_| async {
                    Err(ExecutorError::Invocation("deliberate".into()))
                })
                .register("stall", |_| async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(serde_json::Value::Null)
                }),
        )
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");

        let server = Arc::new(IpcServer::new(&path, echo_registry()));
        let handle = server.clone().spawn().unwrap();

        let client = IpcClient::connect(&path).await.unwrap();
        let result = client
            .call("echo", vec![serde_json::json!(1), serde_json::json!("two")])
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!([1, "two"]));

        // Ids keep correlating across sequential calls.
        let again = client.call("echo", vec![serde_json::json!(3)]).await.unwrap();
        assert_eq!(again, serde_json::json!([3]));

        server.shutdown_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn remote_failures_arrive_as_error_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail.sock");

        let server = Arc::new(IpcServer::new(&path, echo_registry()));
        let handle = server.clone().spawn().unwrap();

        let client = IpcClient::connect(&path).await.unwrap();

        let err = client.call("fail", vec![]).await.unwrap_err();
        assert!(matches!(err, IpcError::Remote(_)));

        let err = client.call("no-such-method", vec![]).await.unwrap_err();
        match err {
            IpcError::Remote(msg) => assert!(msg.contains("no-such-method")),
            other => panic!("expected Remote, got {other}"),
        }

        server.shutdown_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn calls_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stall.sock");

        let server = Arc::new(IpcServer::new(&path, echo_registry()));
        let handle = server.clone().spawn().unwrap();

        let client = IpcClient::connect(&path)
            .await
            .unwrap()
            .with_call_timeout(Duration::from_millis(50));
        let err = client.call("stall", vec![]).await.unwrap_err();
        assert!(matches!(err, IpcError::Timeout { .. }));

        server.shutdown_token().cancel();
        handle.await.unwrap();
    }
}
