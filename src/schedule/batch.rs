//! Coalescing batcher.
//!
//! Jobs that become ready within a short window are grouped into one inference
//! call to amortize engine overhead. Grouping never reorders jobs and never
//! merges sample buffers; a batch is a list of independent segments. A job
//! that would push the batch past the total-duration cap goes back to the
//! front of the queue for the next round.

use crate::schedule::job::{JobState, TranscriptionJob};
use crate::schedule::queue::JobQueue;
use std::time::Duration;

/// Collects a batch starting from `first`, draining jobs that arrive within
/// the coalescing window while the total duration stays under the cap.
pub async fn collect_batch(
    queue: &JobQueue,
    first: TranscriptionJob,
    window: Duration,
    max_total_ms: u32,
) -> Vec<TranscriptionJob> {
    let mut total_ms = first.duration_ms;
    let mut batch = vec![first];

    if !window.is_zero() {
        let deadline = tokio::time::Instant::now() + window;
        while total_ms < max_total_ms {
            let next = match tokio::time::timeout_at(deadline, queue.pop()).await {
                Ok(Some(job)) => job,
                // Queue closed or window elapsed: ship what we have.
                Ok(None) | Err(_) => break,
            };
            if total_ms + next.duration_ms > max_total_ms {
                queue.push_front(next);
                break;
            }
            total_ms += next.duration_ms;
            batch.push(next);
        }
    }

    for job in &mut batch {
        job.advance(JobState::Batched);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::StreamId;
    use crate::segment::Segment;

    fn job(ordinal: u64, duration_ms: u32) -> TranscriptionJob {
        let samples = vec![0i16; (16 * duration_ms) as usize]; // 16 samples/ms at 16kHz
        let segment = Segment::closed(
            StreamId::new("batch"),
            ordinal * 100,
            ordinal * 100 + 99,
            samples,
            16000,
            duration_ms,
            false,
        );
        TranscriptionJob::new(segment, ordinal)
    }

    #[tokio::test]
    async fn test_zero_window_means_singleton_batches() {
        let queue = JobQueue::new(8);
        queue.push_drop_oldest(job(1, 100)).unwrap();

        let batch = collect_batch(&queue, job(0, 100), Duration::ZERO, 30_000).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].ordinal, 0);
        // Job 1 is still queued for the next round.
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_window_coalesces_ready_jobs() {
        let queue = JobQueue::new(8);
        queue.push_drop_oldest(job(1, 100)).unwrap();
        queue.push_drop_oldest(job(2, 100)).unwrap();

        let batch =
            collect_batch(&queue, job(0, 100), Duration::from_millis(20), 30_000).await;
        assert_eq!(batch.len(), 3);
        let ordinals: Vec<u64> = batch.iter().map(|j| j.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert!(batch.iter().all(|j| j.state() == JobState::Batched));
    }

    #[tokio::test]
    async fn test_duration_cap_pushes_overflow_back() {
        let queue = JobQueue::new(8);
        queue.push_drop_oldest(job(1, 400)).unwrap();

        // Cap of 500ms: the 400ms job would overflow a 200ms batch head only
        // if the cap were lower; with 500 it fits exactly at 600 > 500, so it
        // must go back.
        let batch =
            collect_batch(&queue, job(0, 200), Duration::from_millis(20), 500).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.len(), 1);
        // Order preserved for the next round.
        assert_eq!(queue.try_pop().unwrap().ordinal, 1);
    }

    #[tokio::test]
    async fn test_window_expires_without_more_jobs() {
        let queue = JobQueue::new(8);
        let start = tokio::time::Instant::now();
        let batch =
            collect_batch(&queue, job(0, 100), Duration::from_millis(30), 30_000).await;
        assert_eq!(batch.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_head_already_at_cap() {
        let queue = JobQueue::new(8);
        queue.push_drop_oldest(job(1, 100)).unwrap();

        let batch =
            collect_batch(&queue, job(0, 600), Duration::from_millis(20), 500).await;
        // The head alone exceeds the cap; it still ships as its own batch.
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
