//! Default configuration constants for voxflow.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard for speech recognition and provides a good balance
/// between quality and computational efficiency for voice applications.
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame duration in milliseconds.
///
/// Inbound audio is sliced into fixed 20ms frames before VAD classification.
/// 10, 20 and 30ms are the only supported values.
pub const FRAME_MS: u32 = 20;

/// Bytes per sample for 16-bit signed PCM.
pub const SAMPLE_WIDTH: usize = 2;

/// Default trailing-silence tolerance in frames before a segment closes.
///
/// 35 frames at 20ms is 700ms of hangover, enough to ride out inter-word
/// pauses without splitting an utterance in two.
pub const HANGOVER_FRAMES: u32 = 35;

/// Default pre-roll in frames prepended to a new segment.
///
/// Silence frames kept in a ring while idle and seeded into the segment when
/// speech starts. Captures soft onsets (plosives, fricatives) that occur before
/// energy crosses the VAD threshold.
pub const PRE_ROLL_FRAMES: u32 = 10;

/// Default maximum segment duration in milliseconds.
///
/// A segment is force-closed at this cap even while speech continues, so a
/// monologue cannot grow a segment without bound.
pub const MAX_SEGMENT_MS: u32 = 30_000;

/// Default minimum speech duration in milliseconds for a segment to be dispatched.
///
/// Segments whose speech content is shorter than this are discarded rather than
/// sent to inference. Filters doorknocks and other sub-word blips.
pub const MIN_SEGMENT_MS: u32 = 250;

/// Default maximum number of inference calls in flight at once.
pub const MAX_CONCURRENT_JOBS: usize = 2;

/// Default depth of the scheduler's job queue.
pub const QUEUE_DEPTH: usize = 32;

/// Default time a submission waits for queue space under the `block` policy,
/// in milliseconds, before failing with `Overloaded`.
pub const SUBMIT_TIMEOUT_MS: u64 = 1_000;

/// Default batching window in milliseconds.
///
/// Segments ready within this window are grouped into one inference call.
pub const BATCH_COALESCE_MS: u64 = 5;

/// Default cap on the total audio duration of one batch, in milliseconds.
pub const BATCH_MAX_DURATION_MS: u32 = 30_000;

/// Default retry budget for transient inference failures.
pub const MAX_RETRIES: u32 = 3;

/// Default base backoff between inference retries, in milliseconds.
/// Doubled on each attempt.
pub const RETRY_BACKOFF_MS: u64 = 200;

/// Default per-call inference timeout in milliseconds.
///
/// A call that outlives this is treated as a transient failure so a hung
/// engine cannot wedge a worker slot forever.
pub const INFERENCE_TIMEOUT_MS: u64 = 30_000;

/// Default bound on a stream's reorder buffer, in pending results.
///
/// When exceeded, the oldest outstanding job is skipped with a typed failure
/// so publication keeps making progress.
pub const REORDER_BUFFER_BOUND: usize = 16;

/// Default interval between partial snapshots in milliseconds, when the
/// partial-results extension is enabled.
pub const PARTIAL_INTERVAL_MS: u32 = 1_000;

/// Default language hint passed to the inference engine.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Depth of a stream's inbound byte-chunk channel.
///
/// Bounded so a stream stalled on scheduler backpressure pushes back on its
/// transport instead of buffering audio without limit.
pub const INTAKE_CHANNEL_DEPTH: usize = 32;

/// Depth of a stream's live event channel.
pub const LIVE_CHANNEL_DEPTH: usize = 64;

/// How long a gracefully closing stream waits for its outstanding results
/// before the sink is torn down, in milliseconds.
pub const CLOSE_DRAIN_GRACE_MS: u64 = 5_000;

/// Default broker routing key for transcript and failure events.
pub const TRANSCRIPT_TOPIC: &str = "stt.transcripts";
