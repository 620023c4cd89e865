//! Audio ingestion: frame assembly and voice activity detection.

pub mod frame;
pub mod vad;

pub use frame::{AudioFrame, FrameBuffer, StreamFormat, StreamId};
pub use vad::{FrameClass, Vad, VadConfig, VadMode, calculate_rms};
