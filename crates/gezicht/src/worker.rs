//! Worker handle: one face-recognition process and its command queue.
//!
//! # Lifecycle
//!
//! `Starting` → `Ready` once every face in the creation-time registry snapshot
//! has been replayed into the process, or `Starting` → `Failed` if any replay
//! fails. Output EOF, a command timeout, or shutdown also end in `Failed`.
//! Nothing leaves `Failed`.
//!
//! # Commands
//!
//! Every command holds the worker's capacity-1 [`SerialQueue`] from dispatch
//! until its reply arrives. Registry changes use the priority lane, detections
//! the normal lane after waiting for `Ready`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::process::Child;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio_util::codec::{AnyDelimiterCodecError, FramedRead, FramedWrite};

use crate::bridge::codec::{NdjsonCodec, line_framing};
use crate::bridge::protocol::{Command, LearnedFace, RequestId, WorkerRequest, WorkerResponse};
use crate::bridge::router::{Reply, ResponseRouter};
use crate::bridge::stream::{STREAM_PREFIX, StreamEndpoint};
use crate::detection::{DetectInput, Detection};
use crate::health::{WorkerHealth, WorkerSnapshot};
use crate::permit::{Lane, LearnPermit, PermitError, SerialQueue, Ticket};
use crate::registry::{Encoding, FaceRegistry};
use crate::spawner::{BoxedReader, BoxedWriter, SpawnError, WorkerSpawnConfig, WorkerSpawner};

const EVENT_CAPACITY: usize = 64;
const STDERR_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker answered with a truthy `error`; carried as-is.
    #[error("worker command failed: {0}")]
    Command(serde_json::Value),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker closed before replying")]
    Closed,
    #[error("worker {worker} is unavailable")]
    Unavailable { worker: u64 },
    #[error("worker did not reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Queue(#[from] PermitError),
}

/// Out-of-band notifications from a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Ready,
    Failed { reason: String },
    /// One line the process wrote to stderr.
    Stderr(String),
}

/// Reply channel for a request written with [`WorkerHandle::send`].
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn recv(self) -> Result<serde_json::Value, WorkerError> {
        match self.rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(WorkerError::Command(error)),
            Err(_) => Err(WorkerError::Closed),
        }
    }
}

/// Health state shared with the output reader task.
struct Lifecycle {
    worker_id: u64,
    health: watch::Sender<WorkerHealth>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Lifecycle {
    fn new(worker_id: u64) -> Self {
        let (health, _) = watch::channel(WorkerHealth::Starting);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            worker_id,
            health,
            events,
        }
    }

    fn current(&self) -> WorkerHealth {
        *self.health.borrow()
    }

    fn mark_ready(&self) -> bool {
        let changed = self.health.send_if_modified(|health| {
            if *health == WorkerHealth::Starting {
                *health = WorkerHealth::Ready;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(worker_id = self.worker_id, "Worker ready");
            let _ = self.events.send(WorkerEvent::Ready);
        }
        changed
    }

    fn mark_failed(&self, reason: impl Into<String>) -> bool {
        let changed = self.health.send_if_modified(|health| {
            if *health != WorkerHealth::Failed {
                *health = WorkerHealth::Failed;
                true
            } else {
                false
            }
        });
        if changed {
            let reason = reason.into();
            tracing::error!(worker_id = self.worker_id, %reason, "Worker failed");
            let _ = self.events.send(WorkerEvent::Failed { reason });
        }
        changed
    }
}

/// What a new worker learns before it reports ready.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    /// Pushed with `add-face-encoding`, one command per face.
    pub encodings: FaceRegistry,
    /// Learned from images with `learn-face`, after the encodings.
    pub images: Vec<(String, Vec<PathBuf>)>,
}

impl Replay {
    fn into_steps(self) -> Vec<ReplayStep> {
        let mut steps: Vec<ReplayStep> = self
            .encodings
            .iter()
            .map(|(name, encodings)| ReplayStep::Encodings(name.to_string(), encodings.to_vec()))
            .collect();
        steps.extend(
            self.images
                .into_iter()
                .filter(|(_, paths)| !paths.is_empty())
                .map(|(name, paths)| ReplayStep::Images(name, paths)),
        );
        steps
    }
}

impl From<FaceRegistry> for Replay {
    fn from(encodings: FaceRegistry) -> Self {
        Self {
            encodings,
            images: Vec::new(),
        }
    }
}

enum ReplayStep {
    Encodings(String, Vec<Encoding>),
    Images(String, Vec<PathBuf>),
}

/// Counts a command as outstanding until dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerHandle {
    id: u64,
    spawned_at: DateTime<Utc>,
    writer: Mutex<Option<FramedWrite<BoxedWriter, NdjsonCodec<WorkerRequest>>>>,
    router: Arc<ResponseRouter>,
    queue: SerialQueue,
    lifecycle: Arc<Lifecycle>,
    in_flight: Arc<AtomicUsize>,
    /// Faces pushed into this process, as acknowledged by it.
    replica: StdMutex<FaceRegistry>,
    command_timeout: Option<Duration>,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("health", &self.health())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Spawn the process and start replaying `replay` into it.
    ///
    /// Returns as soon as the process is running; use [`ready`](Self::ready)
    /// or [`subscribe`](Self::subscribe) to learn how startup ends. Must be
    /// called inside a tokio runtime.
    pub fn spawn(
        config: &WorkerSpawnConfig,
        spawner: &dyn WorkerSpawner,
        replay: Replay,
        command_timeout: Option<Duration>,
    ) -> Result<Arc<Self>, SpawnError> {
        let process = spawner.spawn(config)?;
        let worker_id = config.worker_id;

        let router = Arc::new(ResponseRouter::new());
        let lifecycle = Arc::new(Lifecycle::new(worker_id));

        tokio::spawn(read_responses(
            process.stdout,
            Arc::clone(&router),
            Arc::clone(&lifecycle),
        ));
        if let Some(stderr) = process.stderr {
            tokio::spawn(read_stderr(stderr, Arc::clone(&lifecycle)));
        }

        let handle = Arc::new(Self {
            id: worker_id,
            spawned_at: Utc::now(),
            writer: Mutex::new(Some(FramedWrite::new(process.stdin, NdjsonCodec::new()))),
            router,
            queue: SerialQueue::new(),
            lifecycle,
            in_flight: Arc::new(AtomicUsize::new(0)),
            replica: StdMutex::new(FaceRegistry::new()),
            command_timeout,
            child: Mutex::new(process.child),
        });

        // Reserve every step now so nothing queued later can run first.
        let steps: Vec<(ReplayStep, Ticket)> = replay
            .into_steps()
            .into_iter()
            .map(|step| (step, handle.queue.reserve(Lane::Priority)))
            .collect();

        tracing::debug!(worker_id, steps = steps.len(), "Replaying registry into worker");
        let starting = Arc::clone(&handle);
        tokio::spawn(async move {
            let result = futures::future::try_join_all(
                steps
                    .into_iter()
                    .map(|(step, ticket)| starting.replay_step(ticket, step)),
            )
            .await;
            match result {
                Ok(_) => {
                    starting.lifecycle.mark_ready();
                }
                Err(e) => {
                    starting
                        .lifecycle
                        .mark_failed(format!("registry replay failed: {e}"));
                }
            }
        });

        Ok(handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn health(&self) -> WorkerHealth {
        self.lifecycle.current()
    }

    /// Commands queued or running on this worker.
    pub fn outstanding(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Faces this worker's process has acknowledged.
    pub fn replica(&self) -> FaceRegistry {
        self.replica_lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.lifecycle.events.subscribe()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            health: self.health(),
            outstanding: self.outstanding(),
            faces: self.replica_lock().face_count(),
            spawned_at: self.spawned_at,
        }
    }

    /// Wait until startup ends. Errors if the worker failed.
    pub async fn ready(&self) -> Result<(), WorkerError> {
        let mut rx = self.lifecycle.health.subscribe();
        let health = *rx
            .wait_for(|health| *health != WorkerHealth::Starting)
            .await
            .map_err(|_| WorkerError::Closed)?;
        match health {
            WorkerHealth::Ready => Ok(()),
            _ => Err(WorkerError::Unavailable { worker: self.id }),
        }
    }

    /// Write a command and register for its reply. Bypasses the queue.
    pub async fn send(&self, command: Command) -> Result<PendingReply, WorkerError> {
        let id = RequestId::new();
        let rx = self.router.register(id);
        if let Err(e) = self.write(WorkerRequest { id, command }).await {
            self.router.forget(&id);
            return Err(e);
        }
        Ok(PendingReply { id, rx })
    }

    /// Write a command without waiting for any reply.
    pub async fn notify(&self, command: Command) -> Result<RequestId, WorkerError> {
        let id = RequestId::new();
        self.write(WorkerRequest { id, command }).await?;
        Ok(id)
    }

    /// Learn a face from images. The permit proves the pool-wide learn queue is held.
    pub async fn learn_face(
        &self,
        _permit: &LearnPermit,
        name: &str,
        paths: Vec<PathBuf>,
    ) -> Result<Vec<Encoding>, WorkerError> {
        let _in_flight = InFlight::enter(&self.in_flight);
        let ticket = self.queue.reserve(Lane::Priority);
        self.learn(ticket, name, paths).await
    }

    pub async fn add_face_encoding(
        &self,
        name: &str,
        encodings: Vec<Encoding>,
    ) -> Result<(), WorkerError> {
        let _in_flight = InFlight::enter(&self.in_flight);
        let ticket = self.queue.reserve(Lane::Priority);
        self.push_encodings(ticket, name.to_string(), encodings)
            .await
    }

    pub async fn detect_faces(&self, input: DetectInput) -> Result<Detection, WorkerError> {
        let _in_flight = InFlight::enter(&self.in_flight);
        self.ready().await?;
        match input {
            DetectInput::Path(file_path) => self.detect(Command::DetectFace { file_path }).await,
            DetectInput::Camera => self.detect(Command::DetectPicam).await,
            DetectInput::Stream(source) => self.detect_stream(source).await,
        }
    }

    pub async fn detect_faces_pi(&self) -> Result<Detection, WorkerError> {
        self.detect_faces(DetectInput::Camera).await
    }

    /// Close stdin, kill the process and fail everything still waiting.
    pub async fn shutdown(&self) {
        self.queue.close();
        self.writer.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(worker_id = self.id, error = %e, "Kill failed");
            }
            if let Err(e) = child.wait().await {
                tracing::warn!(worker_id = self.id, error = %e, "Failed to reap worker process");
            }
        }
        self.router.close();
        self.lifecycle.mark_failed("shut down");
    }

    async fn detect(&self, command: Command) -> Result<Detection, WorkerError> {
        let ticket = self.queue.reserve(Lane::Normal);
        let (output, duration) = self.execute(ticket, command).await?;
        Ok(Detection::new(output, duration))
    }

    async fn detect_stream(&self, source: BoxedReader) -> Result<Detection, WorkerError> {
        let _permit = self.queue.acquire(Lane::Normal).await?;
        self.ensure_available()?;

        let endpoint = StreamEndpoint::bind(STREAM_PREFIX)?;
        let stream_path = endpoint.path().to_path_buf();

        let started = Instant::now();
        let pending = self.send(Command::DetectStream { stream_path }).await?;
        let worker_id = self.id;
        let transfer = tokio::spawn(async move {
            if let Err(e) = endpoint.serve(source).await {
                tracing::warn!(worker_id, error = %e, "Stream transfer failed");
            }
        });

        let reply = self.await_reply(pending).await;
        let duration = started.elapsed();
        // The worker may answer without ever connecting.
        transfer.abort();

        Ok(Detection::new(reply?, duration))
    }

    async fn replay_step(&self, ticket: Ticket, step: ReplayStep) -> Result<(), WorkerError> {
        match step {
            ReplayStep::Encodings(name, encodings) => {
                self.push_encodings(ticket, name, encodings).await
            }
            ReplayStep::Images(name, paths) => self.learn(ticket, &name, paths).await.map(|_| ()),
        }
    }

    async fn learn(
        &self,
        ticket: Ticket,
        name: &str,
        paths: Vec<PathBuf>,
    ) -> Result<Vec<Encoding>, WorkerError> {
        let (result, duration) = self
            .execute(
                ticket,
                Command::LearnFace {
                    name: name.to_string(),
                    paths,
                },
            )
            .await?;

        let learned: LearnedFace = serde_json::from_value(result)
            .map_err(|e| WorkerError::Protocol(format!("invalid learn-face result: {e}")))?;
        self.replica_lock()
            .append(name, learned.encodings.iter().cloned());

        tracing::info!(
            worker_id = self.id,
            face = name,
            encodings = learned.encodings.len(),
            duration_ms = duration.as_millis() as u64,
            "Learned face"
        );
        Ok(learned.encodings)
    }

    async fn push_encodings(
        &self,
        ticket: Ticket,
        name: String,
        encodings: Vec<Encoding>,
    ) -> Result<(), WorkerError> {
        let count = encodings.len();
        let command = Command::AddFaceEncoding {
            name: name.clone(),
            encodings: encodings.clone(),
        };
        self.execute(ticket, command).await?;
        self.replica_lock().append(&name, encodings);
        tracing::debug!(worker_id = self.id, face = %name, count, "Pushed face encodings");
        Ok(())
    }

    /// Run one command under a queue ticket. Returns the result and the
    /// dispatch-to-reply time.
    async fn execute(
        &self,
        ticket: Ticket,
        command: Command,
    ) -> Result<(serde_json::Value, Duration), WorkerError> {
        let _permit = ticket.acquire().await?;
        self.ensure_available()?;

        let name = command.name();
        let started = Instant::now();
        let pending = self.send(command).await?;
        tracing::trace!(worker_id = self.id, request_id = %pending.id(), command = name, "Dispatched");
        let result = self.await_reply(pending).await?;
        Ok((result, started.elapsed()))
    }

    async fn await_reply(&self, pending: PendingReply) -> Result<serde_json::Value, WorkerError> {
        let Some(limit) = self.command_timeout else {
            return pending.recv().await;
        };
        let id = pending.id();
        match tokio::time::timeout(limit, pending.recv()).await {
            Ok(reply) => reply,
            Err(_) => {
                self.router.forget(&id);
                self.lifecycle
                    .mark_failed(format!("request {id} timed out after {limit:?}"));
                Err(WorkerError::Timeout(limit))
            }
        }
    }

    async fn write(&self, request: WorkerRequest) -> Result<(), WorkerError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(WorkerError::Closed)?;
        writer.send(request).await?;
        Ok(())
    }

    fn ensure_available(&self) -> Result<(), WorkerError> {
        if self.health() == WorkerHealth::Failed {
            return Err(WorkerError::Unavailable { worker: self.id });
        }
        Ok(())
    }

    fn replica_lock(&self) -> MutexGuard<'_, FaceRegistry> {
        self.replica.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_responses(
    stdout: BoxedReader,
    router: Arc<ResponseRouter>,
    lifecycle: Arc<Lifecycle>,
) {
    let mut reader = FramedRead::new(stdout, NdjsonCodec::<WorkerResponse>::new());
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(response) => {
                router.route(response);
            }
            Err(e) => {
                tracing::warn!(worker_id = lifecycle.worker_id, error = %e, "Worker output read failed");
                break;
            }
        }
    }
    lifecycle.mark_failed("worker output closed");
    router.close();
}

async fn read_stderr(stderr: BoxedReader, lifecycle: Arc<Lifecycle>) {
    // Keeps draining whatever the bytes are, or the process blocks on a full pipe.
    let mut lines = FramedRead::new(stderr, line_framing(STDERR_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(chunk) => {
                let line = String::from_utf8_lossy(&chunk).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::warn!(worker_id = lifecycle.worker_id, line = %line, "Worker stderr");
                let _ = lifecycle.events.send(WorkerEvent::Stderr(line));
            }
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => continue,
            Err(AnyDelimiterCodecError::Io(e)) => {
                tracing::debug!(worker_id = lifecycle.worker_id, error = %e, "Worker stderr closed");
                break;
            }
        }
    }
}
