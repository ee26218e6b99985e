//! Health status and snapshot types for workers and the pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one worker. Nothing leaves `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerHealth {
    /// Process spawned, registry replay in progress
    #[default]
    Starting,
    /// Replay finished, accepting detections
    Ready,
    /// Replay failed, process exited, or a command timed out
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub health: WorkerHealth,
    /// Commands queued or running on this worker.
    pub outstanding: usize,
    /// Distinct faces pushed into this worker's process.
    pub faces: usize,
    pub spawned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerSnapshot>,
    pub faces: usize,
    pub encodings: usize,
    /// Faces registered from images, learned by each worker at startup.
    pub image_faces: usize,
    pub max_instance_count: usize,
}

impl PoolSnapshot {
    pub fn ready_workers(&self) -> usize {
        self.count(WorkerHealth::Ready)
    }

    pub fn failed_workers(&self) -> usize {
        self.count(WorkerHealth::Failed)
    }

    /// At max size with every worker occupied.
    pub fn is_saturated(&self) -> bool {
        self.workers.len() >= self.max_instance_count
            && self.workers.iter().all(|w| w.outstanding > 0)
    }

    fn count(&self, health: WorkerHealth) -> usize {
        self.workers.iter().filter(|w| w.health == health).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: u64, health: WorkerHealth, outstanding: usize) -> WorkerSnapshot {
        WorkerSnapshot {
            id,
            health,
            outstanding,
            faces: 0,
            spawned_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn health_default_is_starting() {
        assert_eq!(WorkerHealth::default(), WorkerHealth::Starting);
    }

    #[test]
    fn health_serializes_lowercase() {
        insta::assert_json_snapshot!(
            [WorkerHealth::Starting, WorkerHealth::Ready, WorkerHealth::Failed],
            @r#"
        [
          "starting",
          "ready",
          "failed"
        ]
        "#
        );
    }

    #[test]
    fn worker_snapshot_serializes() {
        insta::assert_json_snapshot!(worker(1, WorkerHealth::Ready, 2), @r#"
        {
          "id": 1,
          "health": "ready",
          "outstanding": 2,
          "faces": 0,
          "spawned_at": "2024-05-01T12:00:00Z"
        }
        "#);
    }

    #[test]
    fn pool_counts_by_health() {
        let snapshot = PoolSnapshot {
            workers: vec![
                worker(0, WorkerHealth::Ready, 0),
                worker(1, WorkerHealth::Failed, 0),
                worker(2, WorkerHealth::Ready, 1),
                worker(3, WorkerHealth::Starting, 0),
            ],
            faces: 0,
            encodings: 0,
            image_faces: 0,
            max_instance_count: 4,
        };
        assert_eq!(snapshot.ready_workers(), 2);
        assert_eq!(snapshot.failed_workers(), 1);
        assert!(!snapshot.is_saturated());
    }

    #[test]
    fn saturated_when_full_and_all_busy() {
        let snapshot = PoolSnapshot {
            workers: vec![
                worker(0, WorkerHealth::Ready, 3),
                worker(1, WorkerHealth::Ready, 1),
            ],
            faces: 0,
            encodings: 0,
            image_faces: 0,
            max_instance_count: 2,
        };
        assert!(snapshot.is_saturated());
    }
}
