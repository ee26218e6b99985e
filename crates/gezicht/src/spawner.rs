//! Worker process spawning.
//!
//! [`WorkerSpawner`] is the seam between a [`WorkerHandle`](crate::WorkerHandle)
//! and the OS: the default [`ProcessSpawner`] runs `<binary> <script>` with
//! piped stdio, tests plug in an in-process fake.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub worker_id: u64,
    pub worker_binary: PathBuf,
    pub worker_script: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// The stdio of a spawned worker, plus the child when there is a real process.
pub struct WorkerProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Option<Child>,
}

impl WorkerProcess {
    pub fn from_child(mut child: Child) -> Result<Self, SpawnError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as BoxedReader);

        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            child: Some(child),
        })
    }

    pub fn from_streams(
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: None,
            child: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("has_stderr", &self.stderr.is_some())
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish()
    }
}

pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerProcess, SpawnError>;
}

/// Spawns `<worker_binary> <worker_script>` as a child process.
///
/// The child is killed when its handle is dropped.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerProcess, SpawnError> {
        let child = Command::new(&config.worker_binary)
            .arg(&config.worker_script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tracing::debug!(
            worker_id = config.worker_id,
            pid = child.id(),
            binary = %config.worker_binary.display(),
            script = %config.worker_script.display(),
            "Spawned worker process"
        );
        WorkerProcess::from_child(child)
    }
}
