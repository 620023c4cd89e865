//! Transcription scheduler: bounded intake, batching, and the inference
//! worker pool.
//!
//! One dispatch task pops jobs, coalesces them into batches and hands each
//! batch to a worker guarded by a semaphore permit — `max_concurrent_jobs` is
//! the single concurrency control and the primary backpressure lever.
//! Inference runs on the blocking thread pool because the engine contract
//! allows synchronous-blocking calls.

use crate::defaults;
use crate::engine::{EngineRequest, InferenceEngine};
use crate::error::{Result, VoxflowError};
use crate::publish::publisher::{ResultPublisher, SegmentOutcome};
use crate::publish::FailureKind;
use crate::schedule::batch::collect_batch;
use crate::schedule::job::{JobId, JobState, TranscriptionJob};
use crate::schedule::queue::JobQueue;
use crate::segment::Segment;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What happens to a new submission when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverloadPolicy {
    /// Wait for space up to the submit timeout, then fail with `Overloaded`.
    #[default]
    Block,
    /// Evict the oldest queued job and surface it as a typed failure.
    DropOldest,
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum inference calls in flight at once.
    pub max_concurrent_jobs: usize,
    /// Depth of the intake queue.
    pub queue_depth: usize,
    /// Behavior when the intake queue is full.
    pub overload_policy: OverloadPolicy,
    /// How long a blocking submission waits for queue space.
    pub submit_timeout: Duration,
    /// Coalescing window for batching.
    pub batch_coalesce: Duration,
    /// Cap on the total audio duration of one batch.
    pub batch_max_duration_ms: u32,
    /// Retry budget for transient inference failures.
    pub max_retries: u32,
    /// Base backoff between retries, doubled per attempt.
    pub retry_backoff: Duration,
    /// Per-call inference timeout.
    pub inference_timeout: Duration,
    /// Language hint forwarded to the engine.
    pub language: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::MAX_CONCURRENT_JOBS,
            queue_depth: defaults::QUEUE_DEPTH,
            overload_policy: OverloadPolicy::default(),
            submit_timeout: Duration::from_millis(defaults::SUBMIT_TIMEOUT_MS),
            batch_coalesce: Duration::from_millis(defaults::BATCH_COALESCE_MS),
            batch_max_duration_ms: defaults::BATCH_MAX_DURATION_MS,
            max_retries: defaults::MAX_RETRIES,
            retry_backoff: Duration::from_millis(defaults::RETRY_BACKOFF_MS),
            inference_timeout: Duration::from_millis(defaults::INFERENCE_TIMEOUT_MS),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
        }
    }
}

/// Schedules closed segments onto the inference engine.
pub struct TranscriptionScheduler {
    config: SchedulerConfig,
    queue: Arc<JobQueue>,
    semaphore: Arc<Semaphore>,
    publisher: Arc<ResultPublisher>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptionScheduler {
    /// Creates the scheduler and spawns its dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<dyn InferenceEngine>,
        publisher: Arc<ResultPublisher>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(config.queue_depth));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        let dispatcher = tokio::spawn(dispatch_loop(
            config.clone(),
            queue.clone(),
            semaphore.clone(),
            engine,
            publisher.clone(),
        ));

        Self {
            config,
            queue,
            semaphore,
            publisher,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Submits a closed segment for transcription.
    ///
    /// Reserves the stream's next ordering slot, then enqueues under the
    /// configured overload policy. An `Overloaded` failure is surfaced both as
    /// the returned error (for upstream backpressure) and as a typed failure
    /// event, so the gap is never silent.
    pub async fn submit(&self, segment: Segment) -> Result<JobId> {
        let stream = segment.stream.clone();
        let Some(ordinal) = self.publisher.expect(
            &stream,
            segment.start_sequence,
            segment.end_sequence,
            segment.partial,
        ) else {
            return Err(VoxflowError::StreamClosed {
                stream: stream.to_string(),
            });
        };

        let job = TranscriptionJob::new(segment, ordinal);
        let job_id = job.id;
        debug!(%stream, ordinal, job = %job_id, "segment submitted");

        match self.config.overload_policy {
            OverloadPolicy::Block => {
                match self.queue.push_blocking(job, self.config.submit_timeout).await {
                    Ok(()) => Ok(job_id),
                    Err(error) => {
                        self.publisher.complete(
                            &stream,
                            ordinal,
                            SegmentOutcome::Failure {
                                kind: FailureKind::Overloaded,
                                message: error.to_string(),
                            },
                        );
                        Err(error)
                    }
                }
            }
            OverloadPolicy::DropOldest => {
                match self.queue.push_drop_oldest(job) {
                    Ok(Some(evicted)) => {
                        warn!(
                            stream = %evicted.stream,
                            ordinal = evicted.ordinal,
                            "queue full; evicted oldest job"
                        );
                        self.publisher.complete(
                            &evicted.stream,
                            evicted.ordinal,
                            SegmentOutcome::Failure {
                                kind: FailureKind::Overloaded,
                                message: "evicted by a newer segment under overload".to_string(),
                            },
                        );
                        Ok(job_id)
                    }
                    Ok(None) => Ok(job_id),
                    Err(error) => {
                        self.publisher.complete(
                            &stream,
                            ordinal,
                            SegmentOutcome::Failure {
                                kind: FailureKind::Overloaded,
                                message: error.to_string(),
                            },
                        );
                        Err(error)
                    }
                }
            }
        }
    }

    /// Number of jobs waiting in the intake queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stops intake, drains queued and in-flight jobs, then returns.
    pub async fn shutdown(&self) {
        self.queue.close();
        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
        // Workers hold permits until their batch is done; acquiring the whole
        // pool is the drain barrier.
        let _ = self
            .semaphore
            .acquire_many(self.config.max_concurrent_jobs.max(1) as u32)
            .await;
    }
}

async fn dispatch_loop(
    config: SchedulerConfig,
    queue: Arc<JobQueue>,
    semaphore: Arc<Semaphore>,
    engine: Arc<dyn InferenceEngine>,
    publisher: Arc<ResultPublisher>,
) {
    while let Some(first) = queue.pop().await {
        let batch = collect_batch(
            &queue,
            first,
            config.batch_coalesce,
            config.batch_max_duration_ms,
        )
        .await;

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let engine = engine.clone();
        let publisher = publisher.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_batch(config, engine, publisher, batch).await;
        });
    }
    debug!("scheduler dispatch loop drained");
}

/// Runs one batch to completion, including the retry loop.
async fn run_batch(
    config: SchedulerConfig,
    engine: Arc<dyn InferenceEngine>,
    publisher: Arc<ResultPublisher>,
    mut batch: Vec<TranscriptionJob>,
) {
    let requests: Arc<Vec<EngineRequest>> = Arc::new(
        batch
            .iter_mut()
            .map(|job| EngineRequest {
                samples: std::mem::take(&mut job.samples),
                sample_rate: job.sample_rate,
            })
            .collect(),
    );
    for job in &mut batch {
        job.advance(JobState::InFlight);
    }

    let mut attempt: u32 = 0;
    let outcome = loop {
        let call_engine = engine.clone();
        let call_requests = requests.clone();
        let language = config.language.clone();
        let call = tokio::task::spawn_blocking(move || {
            call_engine.transcribe(&call_requests, &language)
        });

        let result = match tokio::time::timeout(config.inference_timeout, call).await {
            // The blocking call itself cannot be interrupted; the timeout
            // frees the worker slot and the eventual result is ignored.
            Err(_) => Err(VoxflowError::inference(format!(
                "inference call exceeded {}ms",
                config.inference_timeout.as_millis()
            ))),
            Ok(Err(join_error)) => Err(VoxflowError::inference(format!(
                "inference task panicked: {}",
                join_error
            ))),
            Ok(Ok(engine_result)) => engine_result.and_then(|hypotheses| {
                if hypotheses.len() == batch.len() {
                    Ok(hypotheses)
                } else {
                    Err(VoxflowError::inference(format!(
                        "engine returned {} hypotheses for {} segments",
                        hypotheses.len(),
                        batch.len()
                    )))
                }
            }),
        };

        match result {
            Ok(hypotheses) => break Ok(hypotheses),
            Err(error) if error.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let backoff = config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    attempt,
                    max = config.max_retries,
                    %error,
                    "transient inference failure; backing off {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) => break Err(error),
        }
    };

    match outcome {
        Ok(hypotheses) => {
            for (job, hypothesis) in batch.iter_mut().zip(hypotheses) {
                job.advance(JobState::Completed);
                publisher.complete(
                    &job.stream,
                    job.ordinal,
                    SegmentOutcome::Transcript {
                        text: hypothesis.text,
                        confidence: hypothesis.confidence,
                    },
                );
            }
        }
        Err(error) => {
            let kind = match error {
                VoxflowError::InferenceRejected { .. } => FailureKind::Rejected,
                _ => FailureKind::Exhausted,
            };
            let message = error.to_string();
            warn!(%error, jobs = batch.len(), "batch failed");
            for job in &mut batch {
                job.advance(JobState::Errored);
                publisher.complete(
                    &job.stream,
                    job.ordinal,
                    SegmentOutcome::Failure {
                        kind,
                        message: message.clone(),
                    },
                );
            }
        }
    }
}
