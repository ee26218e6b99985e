//! Wire plumbing between the pool and worker subprocesses.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerRequest/WorkerResponse, Command)
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **router**: correlation of responses to pending requests
//! - **stream**: one-shot unix socket endpoint for bulk byte transfer

pub mod codec;
pub mod protocol;
pub mod router;
pub mod stream;
