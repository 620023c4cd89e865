//! Bounded job queue with selectable overflow behavior.
//!
//! Single consumer (the dispatch loop), many producers (stream sessions).
//! Producers either wait for space with a deadline or evict the oldest job,
//! depending on the configured overload policy.

use crate::error::{Result, VoxflowError};
use crate::schedule::job::TranscriptionJob;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueInner {
    jobs: VecDeque<TranscriptionJob>,
    closed: bool,
}

/// Bounded FIFO of queued transcription jobs.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    item_ready: Notify,
    space_ready: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity: capacity.max(1),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Pushes a job, waiting up to `timeout` for space.
    ///
    /// Fails with `Overloaded` when the deadline passes with the queue still
    /// full — never a silent drop.
    pub async fn push_blocking(&self, job: TranscriptionJob, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.lock()?;
                if inner.closed {
                    return Err(VoxflowError::Pipeline {
                        message: "job queue is closed".to_string(),
                    });
                }
                if inner.jobs.len() < self.capacity {
                    inner.jobs.push_back(job);
                    self.item_ready.notify_one();
                    return Ok(());
                }
            }
            // Space may be taken by another producer before we re-check; the
            // loop re-evaluates under the lock either way.
            let space = self.space_ready.notified();
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                return Err(VoxflowError::Overloaded {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Pushes a job, evicting the oldest queued job if the queue is full.
    ///
    /// Returns the evicted job so the caller can surface it as a typed
    /// failure.
    pub fn push_drop_oldest(
        &self,
        job: TranscriptionJob,
    ) -> Result<Option<TranscriptionJob>> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(VoxflowError::Pipeline {
                message: "job queue is closed".to_string(),
            });
        }
        let evicted = if inner.jobs.len() >= self.capacity {
            inner.jobs.pop_front()
        } else {
            None
        };
        inner.jobs.push_back(job);
        self.item_ready.notify_one();
        Ok(evicted)
    }

    /// Pops the oldest job, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<TranscriptionJob> {
        loop {
            {
                let mut inner = self.lock().ok()?;
                if let Some(job) = inner.jobs.pop_front() {
                    self.space_ready.notify_one();
                    return Some(job);
                }
                if inner.closed {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Non-blocking pop, used by the batcher inside its coalescing window.
    pub fn try_pop(&self) -> Option<TranscriptionJob> {
        let mut inner = self.lock().ok()?;
        let job = inner.jobs.pop_front();
        if job.is_some() {
            self.space_ready.notify_one();
        }
        job
    }

    /// Returns a just-popped job to the front, preserving order.
    pub(crate) fn push_front(&self, job: TranscriptionJob) {
        if let Ok(mut inner) = self.lock() {
            inner.jobs.push_front(job);
            self.item_ready.notify_one();
        }
    }

    /// Closes the queue. Queued jobs remain poppable; new pushes fail.
    pub fn close(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.closed = true;
        }
        // The single consumer may be parked waiting for items.
        self.item_ready.notify_one();
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueInner>> {
        self.inner.lock().map_err(|_| VoxflowError::Pipeline {
            message: "job queue lock poisoned".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::StreamId;
    use crate::segment::Segment;
    use std::sync::Arc;

    fn job(ordinal: u64) -> TranscriptionJob {
        let segment = Segment::closed(
            StreamId::new("q"),
            ordinal * 10,
            ordinal * 10 + 9,
            vec![0i16; 1600],
            16000,
            100,
            false,
        );
        TranscriptionJob::new(segment, ordinal)
    }

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let queue = JobQueue::new(4);
        queue
            .push_blocking(job(0), Duration::from_millis(10))
            .await
            .unwrap();
        queue
            .push_blocking(job(1), Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(queue.pop().await.unwrap().ordinal, 0);
        assert_eq!(queue.pop().await.unwrap().ordinal, 1);
    }

    #[tokio::test]
    async fn test_blocking_push_times_out_when_full() {
        let queue = JobQueue::new(1);
        queue
            .push_blocking(job(0), Duration::from_millis(10))
            .await
            .unwrap();

        let result = queue.push_blocking(job(1), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(VoxflowError::Overloaded { .. })));
        // The queued job is untouched.
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_push_proceeds_when_space_frees() {
        let queue = Arc::new(JobQueue::new(1));
        queue
            .push_blocking(job(0), Duration::from_millis(10))
            .await
            .unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .push_blocking(job(1), Duration::from_millis(500))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pop().await.unwrap().ordinal, 0);

        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop().await.unwrap().ordinal, 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_head() {
        let queue = JobQueue::new(2);
        assert!(queue.push_drop_oldest(job(0)).unwrap().is_none());
        assert!(queue.push_drop_oldest(job(1)).unwrap().is_none());

        let evicted = queue.push_drop_oldest(job(2)).unwrap().unwrap();
        assert_eq!(evicted.ordinal, 0);
        assert_eq!(queue.pop().await.unwrap().ordinal, 1);
        assert_eq!(queue.pop().await.unwrap().ordinal, 2);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = JobQueue::new(4);
        queue
            .push_blocking(job(0), Duration::from_millis(10))
            .await
            .unwrap();
        queue.close();

        // Remaining jobs still come out, then None.
        assert_eq!(queue.pop().await.unwrap().ordinal, 0);
        assert!(queue.pop().await.is_none());

        // New pushes are refused.
        let result = queue.push_blocking(job(1), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(VoxflowError::Pipeline { .. })));
    }

    #[tokio::test]
    async fn test_close_wakes_parked_consumer() {
        let queue = Arc::new(JobQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_push_front_restores_order() {
        let queue = JobQueue::new(4);
        queue
            .push_blocking(job(1), Duration::from_millis(10))
            .await
            .unwrap();
        let popped = queue.try_pop().unwrap();
        queue.push_front(popped);
        assert_eq!(queue.pop().await.unwrap().ordinal, 1);
    }
}
