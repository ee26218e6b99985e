//! Pool manager: the worker set, the authoritative face registry and the
//! pool-wide learn queue.
//!
//! # Ordering
//!
//! Learning and registration hold the learn queue exclusively (priority lane).
//! Detections that wait for learning take a normal-lane turn on the same queue
//! and release it at once, so they run after every learn queued before them
//! but never block one another. Queue positions are reserved when an operation
//! is called, not when its future is first polled.
//!
//! # Selection
//!
//! Least outstanding commands wins, lowest id breaks ties. A ready worker with
//! [`SPAWN_THRESHOLD`] or more outstanding commands causes a new worker to be
//! created instead, while the pool is below `max_instance_count`. The pool
//! never shrinks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, join_all, try_join_all};
use tokio::runtime::Handle;

use crate::config::{ConfigError, PoolConfig};
use crate::detection::{DetectInput, Detection};
use crate::health::{PoolSnapshot, WorkerHealth};
use crate::permit::{Lane, LearnPermit, PermitError, SerialQueue};
use crate::registry::{Encoding, EncodingLoadError, EncodingSource, FaceRegistry};
use crate::spawner::{SpawnError, WorkerSpawnConfig};
use crate::worker::{Replay, WorkerError, WorkerHandle};

/// Outstanding commands at which a ready worker counts as busy.
pub const SPAWN_THRESHOLD: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Encoding(#[from] EncodingLoadError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Queue(#[from] PermitError),
}

#[derive(Default)]
struct PoolState {
    registry: FaceRegistry,
    /// Faces added from images; every new worker learns these at startup.
    images: BTreeMap<String, Vec<PathBuf>>,
    workers: Vec<Arc<WorkerHandle>>,
    next_id: u64,
}

struct PoolInner {
    config: PoolConfig,
    state: StdMutex<PoolState>,
    learn_queue: SerialQueue,
}

/// Cheap to clone; clones share the same workers and registry.
#[derive(Clone)]
pub struct FacePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for FacePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FacePool")
            .field("config", &self.inner.config)
            .field("workers", &state.workers.len())
            .field("faces", &state.registry.face_count())
            .finish_non_exhaustive()
    }
}

impl FacePool {
    /// Validate `config`. No worker is started until one is needed.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                state: StdMutex::new(PoolState::default()),
                learn_queue: SerialQueue::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Start a worker seeded with the current registry.
    ///
    /// Returns once the process is running; replay continues in the
    /// background. Not bounded by `max_instance_count`.
    pub fn create_worker(&self) -> Result<Arc<WorkerHandle>, PoolError> {
        let mut state = self.lock();
        Ok(self.spawn_locked(&mut state)?)
    }

    /// Create workers up to `min_instance_count` and wait for all to be ready.
    pub async fn warm_up(&self) -> Result<(), PoolError> {
        let workers = {
            let mut state = self.lock();
            while state.workers.len() < self.inner.config.min_instance_count {
                self.spawn_locked(&mut state)?;
            }
            state.workers.clone()
        };
        try_join_all(workers.iter().map(|worker| worker.ready())).await?;
        Ok(())
    }

    /// Pick the worker for the next command, creating one when warranted.
    pub fn select_worker(&self) -> Result<Arc<WorkerHandle>, PoolError> {
        let mut state = self.lock();
        let best = state
            .workers
            .iter()
            .min_by_key(|worker| (worker.outstanding(), worker.id()))
            .cloned();
        let Some(best) = best else {
            tracing::debug!("No workers yet, creating one");
            return Ok(self.spawn_locked(&mut state)?);
        };

        let load = best.outstanding();
        if best.health() == WorkerHealth::Ready
            && load >= SPAWN_THRESHOLD
            && state.workers.len() < self.inner.config.max_instance_count
        {
            tracing::debug!(worker_id = best.id(), load, "Least loaded worker is busy, scaling up");
            return Ok(self.spawn_locked(&mut state)?);
        }
        Ok(best)
    }

    /// Register a face from images.
    ///
    /// Every worker created later learns it during startup. Workers that
    /// already exist learn it in the background under the learn queue; errors
    /// are logged. Outside a tokio runtime existing workers are skipped.
    pub fn add_face(&self, name: impl Into<String>, paths: Vec<PathBuf>) {
        let name = name.into();
        if paths.is_empty() {
            tracing::warn!(face = %name, "Ignoring face without image paths");
            return;
        }
        let ticket = self.inner.learn_queue.reserve(Lane::Priority);
        let workers = {
            let mut state = self.lock();
            state
                .images
                .entry(name.clone())
                .or_default()
                .extend(paths.iter().cloned());
            live_workers(&state.workers)
        };
        if workers.is_empty() {
            tracing::debug!(face = %name, "Face queued for worker startup");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(
                face = %name,
                workers = workers.len(),
                "No tokio runtime, face only learned by new workers"
            );
            return;
        };

        runtime.spawn(async move {
            let permit = match ticket.acquire().await {
                Ok(permit) => LearnPermit::new(permit),
                Err(e) => {
                    tracing::warn!(face = %name, error = %e, "Learn queue closed");
                    return;
                }
            };
            let results = join_all(
                workers
                    .iter()
                    .map(|worker| worker.learn_face(&permit, &name, paths.clone())),
            )
            .await;
            for (worker, result) in workers.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(worker_id = worker.id(), face = %name, error = %e, "Failed to learn face");
                }
            }
        });
    }

    /// Learn a face on one worker and replicate the encodings to the rest.
    ///
    /// Resolves with the new encodings only after every replication succeeded.
    /// The pool registry keeps them as soon as the learning worker answers, so
    /// a failed replication still leaves them registered and every worker
    /// created later replays them.
    pub fn learn_face(
        &self,
        name: impl Into<String>,
        paths: Vec<PathBuf>,
    ) -> BoxFuture<'static, Result<Vec<Encoding>, PoolError>> {
        let name = name.into();
        let ticket = self.inner.learn_queue.reserve(Lane::Priority);
        let pool = self.clone();
        Box::pin(async move {
            if paths.is_empty() {
                return Err(PoolError::InvalidRequest(format!(
                    "no image paths given for face {name}"
                )));
            }
            let permit = LearnPermit::new(ticket.acquire().await?);
            let worker = pool.select_worker()?;
            let encodings = worker.learn_face(&permit, &name, paths).await?;

            let others = {
                let mut state = pool.lock();
                state.registry.append(&name, encodings.iter().cloned());
                live_workers(&state.workers)
                    .into_iter()
                    .filter(|other| other.id() != worker.id())
                    .collect::<Vec<_>>()
            };
            try_join_all(
                others
                    .iter()
                    .map(|other| other.add_face_encoding(&name, encodings.clone())),
            )
            .await?;

            tracing::info!(
                face = %name,
                encodings = encodings.len(),
                replicas = others.len(),
                "Face learned"
            );
            drop(permit);
            Ok(encodings)
        })
    }

    /// Register precomputed encodings, inline or from a JSON file.
    ///
    /// A file that cannot be read or parsed fails the call before anything
    /// changes. Creates a worker when the pool is empty; if that fails the
    /// registry is left untouched. Once stored, a failed push to one worker
    /// is returned but the encodings stay registered.
    pub fn add_face_encoding(
        &self,
        name: impl Into<String>,
        source: impl Into<EncodingSource>,
    ) -> BoxFuture<'static, Result<Vec<Encoding>, PoolError>> {
        let name = name.into();
        let source = source.into();
        let ticket = self.inner.learn_queue.reserve(Lane::Priority);
        let pool = self.clone();
        Box::pin(async move {
            let encodings = source.load().await?;
            let _permit = ticket.acquire().await?;

            let targets = {
                let mut state = pool.lock();
                if state.workers.is_empty() {
                    pool.spawn_locked(&mut state)?;
                }
                state.registry.append(&name, encodings.iter().cloned());
                live_workers(&state.workers)
            };
            try_join_all(
                targets
                    .iter()
                    .map(|worker| worker.add_face_encoding(&name, encodings.clone())),
            )
            .await?;

            tracing::info!(
                face = %name,
                encodings = encodings.len(),
                replicas = targets.len(),
                "Face encodings registered"
            );
            Ok(encodings)
        })
    }

    /// Detect faces in an image path or byte stream.
    ///
    /// With `wait_for_learning`, dispatch waits until every learn queued
    /// before this call has finished.
    pub fn detect_faces(
        &self,
        input: impl Into<DetectInput>,
        wait_for_learning: bool,
    ) -> BoxFuture<'static, Result<Detection, PoolError>> {
        let input = input.into();
        let gate = wait_for_learning.then(|| self.inner.learn_queue.reserve(Lane::Normal));
        let pool = self.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                drop(gate.acquire().await?);
            }
            let worker = pool.select_worker()?;
            Ok(worker.detect_faces(input).await?)
        })
    }

    /// Detect faces in a frame from the worker's camera.
    pub fn detect_faces_pi(
        &self,
        wait_for_learning: bool,
    ) -> BoxFuture<'static, Result<Detection, PoolError>> {
        self.detect_faces(DetectInput::Camera, wait_for_learning)
    }

    pub fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.lock().workers.clone()
    }

    pub fn registry(&self) -> FaceRegistry {
        self.lock().registry.clone()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        PoolSnapshot {
            workers: state.workers.iter().map(|w| w.snapshot()).collect(),
            faces: state.registry.face_count(),
            encodings: state.registry.encoding_count(),
            image_faces: state.images.len(),
            max_instance_count: self.inner.config.max_instance_count,
        }
    }

    /// Stop every worker process. Queued learns fail with a closed queue.
    pub async fn shutdown(&self) {
        self.inner.learn_queue.close();
        let workers = self.workers();
        join_all(workers.iter().map(|worker| worker.shutdown())).await;
        tracing::info!(workers = workers.len(), "Pool shut down");
    }

    fn spawn_locked(&self, state: &mut PoolState) -> Result<Arc<WorkerHandle>, SpawnError> {
        let config = &self.inner.config;
        let spawn_config = WorkerSpawnConfig {
            worker_id: state.next_id,
            worker_binary: config.worker_binary.clone(),
            worker_script: config.worker_script.clone(),
        };
        let replay = Replay {
            encodings: state.registry.clone(),
            images: state
                .images
                .iter()
                .map(|(name, paths)| (name.clone(), paths.clone()))
                .collect(),
        };

        let worker = WorkerHandle::spawn(
            &spawn_config,
            config.spawner.as_ref(),
            replay,
            config.command_timeout,
        )?;
        state.next_id += 1;
        state.workers.push(Arc::clone(&worker));

        tracing::info!(
            worker_id = worker.id(),
            workers = state.workers.len(),
            "Created worker"
        );
        Ok(worker)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn live_workers(workers: &[Arc<WorkerHandle>]) -> Vec<Arc<WorkerHandle>> {
    workers
        .iter()
        .filter(|worker| worker.health() != WorkerHealth::Failed)
        .cloned()
        .collect()
}
