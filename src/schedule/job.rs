//! Transcription jobs: a dispatched segment plus scheduling metadata.

use crate::audio::frame::StreamId;
use crate::segment::{Segment, SegmentStatus};
use std::fmt;

/// Correlation id for one dispatched segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.simple().fmt(f)
    }
}

/// Job lifecycle. Transitions are forward-only; a finished job is never
/// reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Queued,
    Batched,
    InFlight,
    Completed,
    Errored,
}

/// A dispatched segment owned by the scheduler.
#[derive(Debug)]
pub struct TranscriptionJob {
    pub id: JobId,
    pub stream: StreamId,
    /// Per-stream dispatch ordinal; drives the publisher's ordering.
    pub ordinal: u64,
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub partial: bool,
    pub sample_rate: u32,
    /// Total audio duration, used by the batcher's duration cap.
    pub duration_ms: u32,
    /// The segment's samples. Taken (not cloned) when the batch request is
    /// built; empty afterwards.
    pub samples: Vec<i16>,
    state: JobState,
}

impl TranscriptionJob {
    /// Consumes a closed segment into a queued job.
    pub fn new(mut segment: Segment, ordinal: u64) -> Self {
        segment.mark(SegmentStatus::Dispatched);
        let duration_ms = segment.duration_ms();
        Self {
            id: JobId::generate(),
            stream: segment.stream,
            ordinal,
            start_sequence: segment.start_sequence,
            end_sequence: segment.end_sequence,
            partial: segment.partial,
            sample_rate: segment.sample_rate,
            duration_ms,
            samples: segment.samples,
            state: JobState::Queued,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Advances the lifecycle. Going backwards is a logic error.
    pub fn advance(&mut self, state: JobState) {
        debug_assert!(
            state >= self.state,
            "job state may not move backwards ({:?} -> {:?})",
            self.state,
            state
        );
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Segment {
        Segment::closed(
            StreamId::new("job-test"),
            5,
            25,
            vec![0i16; 8000],
            16000,
            400,
            false,
        )
    }

    #[test]
    fn test_job_from_segment() {
        let job = TranscriptionJob::new(segment(), 3);
        assert_eq!(job.ordinal, 3);
        assert_eq!(job.start_sequence, 5);
        assert_eq!(job.end_sequence, 25);
        assert_eq!(job.duration_ms, 500);
        assert_eq!(job.state(), JobState::Queued);
    }

    #[test]
    fn test_job_ids_unique() {
        let a = TranscriptionJob::new(segment(), 0);
        let b = TranscriptionJob::new(segment(), 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_state_advances_forward() {
        let mut job = TranscriptionJob::new(segment(), 0);
        job.advance(JobState::Batched);
        job.advance(JobState::InFlight);
        job.advance(JobState::Completed);
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_state_rejects_backwards() {
        let mut job = TranscriptionJob::new(segment(), 0);
        job.advance(JobState::InFlight);
        job.advance(JobState::Queued);
    }
}
