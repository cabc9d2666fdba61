use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One line of the IPC protocol.
///
/// Requests and responses are correlated by `id`; every message is a
/// single JSON document terminated by `\n`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IpcMessage {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    Response {
        id: u64,
        result: serde_json::Value,
    },
    Error {
        id: u64,
        error: String,
    },
}

impl IpcMessage {
    pub fn id(&self) -> u64 {
        match self {
            IpcMessage::Request { id, .. }
            | IpcMessage::Response { id, .. }
            | IpcMessage::Error { id, .. } => *id,
        }
    }

    /// Serialize to one protocol line (newline included).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

const BUFFER_TAG: &str = "Buffer";

/// Encode binary data for a JSON line: `{"__type":"Buffer","data":"<base64>"}`.
pub fn encode_buffer(bytes: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "__type": BUFFER_TAG,
        "data": STANDARD.encode(bytes),
    })
}

/// Decode a buffer-tagged value back to bytes. Returns `None` for values
/// that are not buffer envelopes.
pub fn decode_buffer(value: &serde_json::Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.get("__type")?.as_str()? != BUFFER_TAG {
        return None;
    }
    STANDARD.decode(obj.get("data")?.as_str()?).ok()
}

/// True when a value is a buffer envelope.
pub fn is_buffer(value: &serde_json::Value) -> bool {
    value
        .get("__type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| t == BUFFER_TAG)
}

/// Pipe path for a module:
/// `<platform-tmp>/adc-platform/<safe-module>-<version>-<lang>`.
///
/// The module name is sanitized to `[A-Za-z0-9_-]` so descriptor names
/// can never escape the directory.
pub fn pipe_path(module: &str, version: &str, lang: &str) -> PathBuf {
    let safe: String = module
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    std::env::temp_dir()
        .join("adc-platform")
        .join(format!("{safe}-{version}-{lang}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let msg = IpcMessage::Request {
            id: 7,
            method: "ping".into(),
            args: vec![serde_json::json!("x")],
        };
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "ping");

        let parsed = IpcMessage::from_line(&line).unwrap();
        assert_eq!(parsed.id(), 7);
    }

    #[test]
    fn response_and_error_round_trip() {
        let response = IpcMessage::Response {
            id: 1,
            result: serde_json::json!({"ok": true}),
        };
        let parsed = IpcMessage::from_line(&response.to_line().unwrap()).unwrap();
        assert!(matches!(parsed, IpcMessage::Response { .. }));

        let error = IpcMessage::Error {
            id: 2,
            error: "boom".into(),
        };
        let parsed = IpcMessage::from_line(&error.to_line().unwrap()).unwrap();
        match parsed {
            IpcMessage::Error { id, error } => {
                assert_eq!(id, 2);
                assert_eq!(error, "boom");
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn buffers_round_trip_through_base64() {
        let payload = [0u8, 1, 2, 255, 128];
        let encoded = encode_buffer(&payload);
        assert!(is_buffer(&encoded));
        assert_eq!(encoded["__type"], "Buffer");
        assert_eq!(decode_buffer(&encoded).unwrap(), payload);
    }

    #[test]
    fn non_buffers_decode_to_none() {
        assert!(decode_buffer(&serde_json::json!("plain")).is_none());
        assert!(decode_buffer(&serde_json::json!({"__type": "Other", "data": "AA=="})).is_none());
        assert!(!is_buffer(&serde_json::json!(42)));
    }

    #[test]
    fn pipe_path_sanitizes_module_names() {
        let path = pipe_path("my module/../evil", "1.2.0", "py");
        let file = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(file, "my-module----evil-1.2.0-py");
        assert!(path.parent().unwrap().ends_with("adc-platform"));
    }
}
