//! Transcription scheduling: job model, bounded queue, batching, worker pool.

pub mod batch;
pub mod job;
pub mod queue;
pub mod scheduler;

pub use job::{JobId, JobState, TranscriptionJob};
pub use queue::JobQueue;
pub use scheduler::{OverloadPolicy, SchedulerConfig, TranscriptionScheduler};
