//! Result publication: typed outbound events, sinks, and per-stream ordering.

pub mod publisher;
pub mod sink;

pub use publisher::{PublisherConfig, ResultPublisher, SegmentOutcome};
pub use sink::{BrokerSink, ChannelLiveSink, FailingBroker, LiveSink, MemoryBroker, NullLiveSink};

use crate::audio::frame::StreamId;
use serde::Serialize;

/// A finished transcript for one segment. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptResult {
    /// Originating stream.
    pub stream: StreamId,
    /// First frame sequence covered by the segment.
    pub start_sequence: u64,
    /// Last frame sequence covered by the segment.
    pub end_sequence: u64,
    /// Segment start in stream time, milliseconds.
    pub start_ms: u64,
    /// Segment end in stream time, milliseconds.
    pub end_ms: u64,
    /// Transcribed text.
    pub text: String,
    /// Engine confidence, 0.0 to 1.0.
    pub confidence: f32,
    /// True for partial snapshots, false for final segment transcripts.
    pub partial: bool,
}

/// Why a segment produced no transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine rejected the input permanently.
    Rejected,
    /// Transient failures exhausted the retry budget.
    Exhausted,
    /// The scheduler shed the job under overload.
    Overloaded,
    /// The reorder buffer bound was hit and the stuck job was skipped.
    Skipped,
}

/// Typed failure surfaced to both sinks so consumers can reconcile gaps.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEvent {
    pub stream: StreamId,
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub kind: FailureKind,
    pub message: String,
}

/// Events pushed to a stream's live channel.
///
/// Transcripts and failures also go to the broker topic; the rest are
/// connection-level notifications only.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Sent once when the stream is accepted.
    Ready {
        stream: StreamId,
        sample_rate: u32,
        frame_ms: u32,
    },
    /// Silence-to-speech transition.
    SpeechStart { sequence: u64 },
    /// Confirmed end of speech.
    SpeechEnd { sequence: u64 },
    /// A segment was below the minimum duration and was not transcribed.
    Discarded {
        start_sequence: u64,
        end_sequence: u64,
        speech_ms: u32,
    },
    /// A transcript, partial or final.
    Transcript(TranscriptResult),
    /// A segment that could not be transcribed.
    Failure(FailureEvent),
    /// A stream-level fault, e.g. malformed audio. Fatal to this stream only.
    Error { stage: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_event_serialization_is_tagged() {
        let event = LiveEvent::SpeechStart { sequence: 7 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "speech_start");
        assert_eq!(json["sequence"], 7);
    }

    #[test]
    fn test_transcript_serializes_inline() {
        let event = LiveEvent::Transcript(TranscriptResult {
            stream: StreamId::new("abc"),
            start_sequence: 10,
            end_sequence: 20,
            start_ms: 200,
            end_ms: 420,
            text: "hello".to_string(),
            confidence: 0.87,
            partial: false,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["text"], "hello");
        assert_eq!(json["stream"], "abc");
        assert_eq!(json["partial"], false);
    }

    #[test]
    fn test_failure_kind_snake_case() {
        let event = LiveEvent::Failure(FailureEvent {
            stream: StreamId::new("abc"),
            start_sequence: 0,
            end_sequence: 5,
            kind: FailureKind::Rejected,
            message: "bad input".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failure");
        assert_eq!(json["kind"], "rejected");
    }
}
