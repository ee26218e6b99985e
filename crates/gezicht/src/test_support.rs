//! In-process fake worker for tests.
//!
//! Speaks the worker line protocol over duplex pipes, records every request it
//! receives, and answers commands one at a time like the real script does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::spawner::{SpawnError, WorkerProcess, WorkerSpawnConfig, WorkerSpawner};

#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub worker: u64,
    pub request: Value,
}

impl Received {
    pub fn command(&self) -> &str {
        self.request["command"].as_str().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeBehaviour {
    /// Sleep before answering each command.
    pub reply_delay: Duration,
    /// Commands that are recorded but never answered.
    pub ignore: Vec<&'static str>,
    /// Commands answered with an error.
    pub fail: Vec<&'static str>,
    /// Close stdout on receipt of this command, as if the process died.
    pub exit_on: Option<&'static str>,
    /// Write garbage and an unknown-id reply before each real reply.
    pub noise: bool,
    /// Write a line of invalid UTF-8 on stdout and stderr before each reply.
    pub binary_noise: bool,
    pub stderr_banner: Option<&'static str>,
}

#[derive(Default)]
struct FakeState {
    behaviour: Mutex<FakeBehaviour>,
    overrides: Mutex<HashMap<u64, FakeBehaviour>>,
    log: Mutex<Vec<Received>>,
    spawned: AtomicU64,
    refuse_spawn: AtomicBool,
}

#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<FakeState>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: FakeBehaviour) -> Self {
        let spawner = Self::default();
        *spawner.state.behaviour.lock().unwrap() = behaviour;
        spawner
    }

    /// Behaviour for the worker spawned with this id.
    pub fn set_behaviour_for(&self, worker: u64, behaviour: FakeBehaviour) {
        self.state.overrides.lock().unwrap().insert(worker, behaviour);
    }

    pub fn refuse_spawn(&self, refuse: bool) {
        self.state.refuse_spawn.store(refuse, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> u64 {
        self.state.spawned.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn received_by(&self, worker: u64) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.worker == worker)
            .collect()
    }

    pub fn commands_for(&self, worker: u64) -> Vec<String> {
        self.received_by(worker)
            .iter()
            .map(|r| r.command().to_string())
            .collect()
    }

    /// Poll the request log until `cond` holds. Panics after 5s.
    pub async fn wait_until(&self, cond: impl Fn(&[Received]) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if cond(&self.state.log.lock().unwrap()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerProcess, SpawnError> {
        if self.state.refuse_spawn.load(Ordering::SeqCst) {
            return Err(SpawnError::Other("fake spawn refused".to_string()));
        }
        self.state.spawned.fetch_add(1, Ordering::SeqCst);

        let behaviour = self
            .state
            .overrides
            .lock()
            .unwrap()
            .get(&config.worker_id)
            .cloned()
            .unwrap_or_else(|| self.state.behaviour.lock().unwrap().clone());

        let (stdin, worker_stdin) = tokio::io::duplex(64 * 1024);
        let (worker_stdout, stdout) = tokio::io::duplex(64 * 1024);
        let (worker_stderr, stderr) = tokio::io::duplex(64 * 1024);

        tokio::spawn(run_fake_worker(
            config.worker_id,
            behaviour,
            Arc::clone(&self.state),
            worker_stdin,
            worker_stdout,
            worker_stderr,
        ));

        Ok(WorkerProcess::from_streams(stdin, stdout).with_stderr(stderr))
    }
}

async fn run_fake_worker(
    worker: u64,
    behaviour: FakeBehaviour,
    state: Arc<FakeState>,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
) {
    if let Some(banner) = behaviour.stderr_banner {
        let _ = stderr.write_all(format!("{banner}\n").as_bytes()).await;
    }

    let mut known: Vec<String> = Vec::new();
    let mut lines = FramedRead::new(stdin, LinesCodec::new());
    while let Some(Ok(line)) = lines.next().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let command = request["command"].as_str().unwrap_or_default().to_string();
        state.log.lock().unwrap().push(Received {
            worker,
            request: request.clone(),
        });

        if behaviour.exit_on == Some(command.as_str()) {
            return;
        }
        if behaviour.ignore.contains(&command.as_str()) {
            continue;
        }
        if !behaviour.reply_delay.is_zero() {
            tokio::time::sleep(behaviour.reply_delay).await;
        }
        if behaviour.noise {
            let _ = stdout
                .write_all(b"this is not json\n\n{\"id\": \"unknown\", \"result\": 1}\n")
                .await;
        }
        if behaviour.binary_noise {
            let _ = stderr.write_all(b"\xff\xfe\x80 traceback\nrecovered\n").await;
            let _ = stdout.write_all(b"\xff\xfe garbage\n").await;
        }

        let id = request["id"].clone();
        let reply = if behaviour.fail.contains(&command.as_str()) {
            json!({"id": id, "error": format!("{command} failed")})
        } else {
            answer(&command, &request, &mut known, id).await
        };
        if stdout
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn answer(command: &str, request: &Value, known: &mut Vec<String>, id: Value) -> Value {
    let name = request["name"].as_str().unwrap_or_default().to_string();
    match command {
        "learn-face" => {
            let encodings: Vec<Value> = request["paths"]
                .as_array()
                .map(|paths| {
                    paths
                        .iter()
                        .map(|p| json!([p.as_str().unwrap_or_default().len() as f64, 0.5]))
                        .collect()
                })
                .unwrap_or_default();
            known.push(name);
            json!({"id": id, "result": {"count": encodings.len(), "encodings": encodings}})
        }
        "add-face-encoding" => {
            let count = request["encodings"].as_array().map_or(0, Vec::len);
            known.push(name);
            json!({"id": id, "result": {"count": count}})
        }
        "detect-face" => {
            let name = known.first().cloned();
            json!({"id": id, "result": {"faces": [
                {"top": 10, "right": 20, "bottom": 30, "left": 5, "name": name}
            ]}})
        }
        "detect-picam" => json!({"id": id, "error": "Did not find picamera module"}),
        "detect-stream" => {
            let path = request["stream_path"].as_str().unwrap_or_default();
            match read_stream(path).await {
                Ok(bytes) => json!({"id": id, "result": {"bytes": bytes, "faces": []}}),
                Err(e) => json!({"id": id, "error": e.to_string()}),
            }
        }
        other => json!({"id": id, "error": format!("unknown command {other}")}),
    }
}

async fn read_stream(path: &str) -> std::io::Result<usize> {
    let mut conn = UnixStream::connect(path).await?;
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await?;
    Ok(buf.len())
}
