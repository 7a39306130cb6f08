//! # Cadence Queue
//!
//! Durable job queue with leased, at-least-once delivery.
//!
//! Features:
//! - Atomic claims: a visible job goes to exactly one worker
//! - Pluggable backend (memory here, SQLite in `cadence-persist`)
//! - Worker pool with concurrency control, heartbeats and handler timeouts
//! - Retry with exponential backoff, then dead-lettering
//! - Idempotency keys, cancellation and progress reporting

pub mod backend;
pub mod job;
pub mod memory;
pub mod sweeper;
pub mod worker;

pub use backend::{Enqueued, QueueBackend, QueueError};
pub use job::{
    deadline_after, JobEntry, JobError, JobFailure, JobFilter, JobId, JobStatus, NewJob,
    DEFAULT_QUEUE,
};
pub use memory::MemoryQueue;
pub use sweeper::LeaseSweeper;
pub use worker::{JobContext, JobHandler, JobObserver, WorkerConfig, WorkerPool};
