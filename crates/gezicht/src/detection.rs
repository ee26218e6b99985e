//! Detection inputs and results.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::spawner::BoxedReader;

/// What to run detection on.
pub enum DetectInput {
    /// Image file the worker opens itself.
    Path(PathBuf),
    /// Bytes handed to the worker over a one-shot unix socket.
    Stream(BoxedReader),
    /// A frame from the worker's attached camera.
    Camera,
}

impl DetectInput {
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        DetectInput::Stream(Box::new(reader))
    }
}

impl std::fmt::Debug for DetectInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectInput::Path(path) => f.debug_tuple("Path").field(path).finish(),
            DetectInput::Stream(_) => f.write_str("Stream(..)"),
            DetectInput::Camera => f.write_str("Camera"),
        }
    }
}

impl From<PathBuf> for DetectInput {
    fn from(path: PathBuf) -> Self {
        DetectInput::Path(path)
    }
}

impl From<&Path> for DetectInput {
    fn from(path: &Path) -> Self {
        DetectInput::Path(path.to_path_buf())
    }
}

impl From<&str> for DetectInput {
    fn from(path: &str) -> Self {
        DetectInput::Path(PathBuf::from(path))
    }
}

impl From<String> for DetectInput {
    fn from(path: String) -> Self {
        DetectInput::Path(PathBuf::from(path))
    }
}

/// One face found by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub left: i64,
    /// Registered name, or whatever the worker reports for unknown faces.
    #[serde(default)]
    pub name: Option<String>,
}

/// Worker output for a detection plus dispatch-to-response time.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    output: serde_json::Value,
    duration: Duration,
}

impl Detection {
    pub fn new(output: serde_json::Value, duration: Duration) -> Self {
        Self { output, duration }
    }

    pub fn output(&self) -> &serde_json::Value {
        &self.output
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Faces from `{"faces": [...]}` output. Entries that do not parse are skipped.
    pub fn faces(&self) -> Vec<FaceMatch> {
        let Some(faces) = self.output.get("faces").and_then(|f| f.as_array()) else {
            return Vec::new();
        };
        faces
            .iter()
            .filter_map(|face| serde_json::from_value(face.clone()).ok())
            .collect()
    }

    /// The worker output with `duration` (milliseconds) merged in.
    ///
    /// Non-object outputs are wrapped as `{"result": ..., "duration": ...}`.
    pub fn into_json(self) -> serde_json::Value {
        let duration = serde_json::Value::from(self.duration.as_millis() as u64);
        match self.output {
            serde_json::Value::Object(mut map) => {
                map.insert("duration".to_string(), duration);
                serde_json::Value::Object(map)
            }
            other => serde_json::json!({ "result": other, "duration": duration }),
        }
    }
}
