//! gezicht: a pool of face-recognition worker processes behind one async API.
//!
//! [`FacePool`] owns the workers, the face registry and the ordering between
//! learning and detection. Each [`WorkerHandle`] drives one external process
//! over a newline-delimited JSON protocol on its stdio.

mod config;
mod detection;
mod health;
mod registry;

pub mod bridge;
pub mod logging;
pub mod permit;
pub mod pool;
pub mod spawner;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, PoolConfig};
pub use detection::{DetectInput, Detection, FaceMatch};
pub use health::{PoolSnapshot, WorkerHealth, WorkerSnapshot};
pub use pool::{FacePool, PoolError};
pub use registry::{Encoding, EncodingLoadError, EncodingSource, FaceRegistry};
pub use spawner::{ProcessSpawner, SpawnError, WorkerProcess, WorkerSpawnConfig, WorkerSpawner};
pub use worker::{PendingReply, Replay, WorkerError, WorkerEvent, WorkerHandle};
