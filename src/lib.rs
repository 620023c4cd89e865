//! voxflow - Real-time audio segmentation and transcription pipeline
//!
//! Unbounded PCM byte streams in, ordered transcripts out: framing, voice
//! activity detection, segment assembly, batched inference scheduling and
//! dual-sink result publication (per-connection live channel plus a durable
//! broker topic).

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod publish;
pub mod schedule;
pub mod segment;
pub mod session;

// Core data flow
pub use audio::frame::{AudioFrame, FrameBuffer, StreamFormat, StreamId};
pub use audio::vad::{FrameClass, Vad, VadConfig, VadMode};
pub use segment::{Assembler, AssemblerConfig, AssemblerEvent, Segment, SegmentStatus};
pub use session::StreamSession;

// Scheduling and inference
pub use engine::{EngineHypothesis, EngineRequest, InferenceEngine, MockEngine};
pub use schedule::{OverloadPolicy, SchedulerConfig, TranscriptionScheduler};

// Publication
pub use publish::{
    BrokerSink, FailureEvent, FailureKind, LiveEvent, LiveSink, PublisherConfig,
    ResultPublisher, TranscriptResult,
};

// Orchestration
pub use pipeline::{Pipeline, StreamHandle};

// Error handling
pub use error::{Result, VoxflowError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.2.0+abc1234"` when git hash is available, `"0.2.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_contains_plus_when_git_hash_present() {
        let ver = version_string();
        // In a git repo build, GIT_HASH is set → expect "0.2.0+<hash>"
        // In CI without git, expect plain "0.2.0"
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            assert!(
                ver.contains('+'),
                "With GIT_HASH set, version should contain '+', got: {}",
                ver
            );
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
