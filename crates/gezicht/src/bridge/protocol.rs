//! Wire protocol types for pool-worker communication.
//!
//! One JSON object per line in both directions:
//! - **Requests** (worker stdin): `{"id": ..., "command": ..., ...payload}`
//! - **Responses** (worker stdout): `{"id": ..., "result": ...}` or `{"id": ..., "error": ...}`

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::registry::Encoding;

/// Correlation id pairing a request with its response on one worker.
///
/// UUID v4 so ids never repeat across the lifetime of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commands understood by the worker script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Derive encodings from images and remember them under `name`.
    LearnFace { name: String, paths: Vec<PathBuf> },

    /// Remember precomputed encodings under `name`.
    AddFaceEncoding {
        name: String,
        encodings: Vec<Encoding>,
    },

    DetectFace { file_path: PathBuf },

    /// Capture a frame from the attached camera and detect on it.
    DetectPicam,

    /// Connect to `stream_path` and detect on the bytes read from it.
    DetectStream { stream_path: PathBuf },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LearnFace { .. } => "learn-face",
            Self::AddFaceEncoding { .. } => "add-face-encoding",
            Self::DetectFace { .. } => "detect-face",
            Self::DetectPicam => "detect-picam",
            Self::DetectStream { .. } => "detect-stream",
        }
    }
}

/// A command frame as written to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: RequestId,
    #[serde(flatten)]
    pub command: Command,
}

/// A frame read from the worker.
///
/// Every field is optional: the worker may push frames that are not replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl WorkerResponse {
    /// The correlation id, if present and well-formed.
    pub fn request_id(&self) -> Option<RequestId> {
        self.id
            .as_ref()
            .and_then(|id| id.as_str())
            .and_then(|id| RequestId::parse(id).ok())
    }

    /// A response fails when its `error` field is truthy.
    pub fn is_failure(&self) -> bool {
        self.error.as_ref().is_some_and(is_truthy)
    }

    /// Split into the caller-facing reply.
    pub fn into_reply(self) -> Result<serde_json::Value, serde_json::Value> {
        if self.is_failure() {
            Err(self.error.unwrap_or(serde_json::Value::Null))
        } else {
            Ok(self.result.unwrap_or(serde_json::Value::Null))
        }
    }
}

/// Result payload of a `learn-face` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnedFace {
    #[serde(default)]
    pub encodings: Vec<Encoding>,
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}
