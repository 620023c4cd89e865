//! Frame types and byte-to-frame assembly.
//!
//! Network reads rarely align to frame boundaries, so the [`FrameBuffer`]
//! accepts arbitrarily sized byte chunks and emits only complete frames,
//! carrying the remainder over to the next push.

use crate::defaults;
use crate::error::{Result, VoxflowError};
use serde::Serialize;
use std::fmt;

/// Identifier for a logical per-connection stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a stream id from a transport-provided identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random stream id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Audio format declared by the transport at connection open.
///
/// Only 16-bit signed little-endian mono PCM is supported; the sample rate and
/// frame duration are restricted to the values the VAD can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count. Must be 1.
    pub channels: u16,
    /// Frame duration in milliseconds. Must be 10, 20 or 30.
    pub frame_ms: u32,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
            frame_ms: defaults::FRAME_MS,
        }
    }
}

impl StreamFormat {
    /// Creates and validates a stream format.
    pub fn new(sample_rate: u32, channels: u16, frame_ms: u32) -> Result<Self> {
        let format = Self {
            sample_rate,
            channels,
            frame_ms,
        };
        format.validate()?;
        Ok(format)
    }

    /// Validates the declared format against what the pipeline supports.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoxflowError::malformed(format!(
                "unsupported sample rate {} Hz (expected 8000, 16000, 32000 or 48000)",
                self.sample_rate
            )));
        }
        if self.channels != 1 {
            return Err(VoxflowError::malformed(format!(
                "unsupported channel count {} (expected mono)",
                self.channels
            )));
        }
        if !matches!(self.frame_ms, 10 | 20 | 30) {
            return Err(VoxflowError::malformed(format!(
                "unsupported frame duration {}ms (expected 10, 20 or 30)",
                self.frame_ms
            )));
        }
        Ok(())
    }

    /// Samples per frame at this format.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate * self.frame_ms / 1000) as usize
    }

    /// Bytes per frame at this format.
    pub fn bytes_per_frame(&self) -> usize {
        self.samples_per_frame() * defaults::SAMPLE_WIDTH
    }
}

/// Audio frame with metadata for tracking through the pipeline.
///
/// Immutable once created; sequence numbers within a stream are strictly
/// increasing and contiguous.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Owning stream.
    pub stream: StreamId,
    /// Sequence number for ordering frames.
    pub sequence: u64,
    /// Audio samples as 16-bit PCM.
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Creates a new audio frame.
    pub fn new(stream: StreamId, sequence: u64, samples: Vec<i16>) -> Self {
        Self {
            stream,
            sequence,
            samples,
        }
    }

    /// Returns the duration of this frame in milliseconds.
    pub fn duration_ms(&self, sample_rate: u32) -> u32 {
        (self.samples.len() as u32 * 1000) / sample_rate
    }
}

/// Assembles raw byte chunks into fixed-duration frames.
///
/// Purely synchronous; retains a carry-over remainder so any chunking of the
/// same byte stream produces the identical frame sequence.
#[derive(Debug)]
pub struct FrameBuffer {
    stream: StreamId,
    format: StreamFormat,
    carry: Vec<u8>,
    next_sequence: u64,
}

impl FrameBuffer {
    /// Creates a frame buffer for a validated stream format.
    pub fn new(stream: StreamId, format: StreamFormat) -> Result<Self> {
        format.validate()?;
        Ok(Self {
            stream,
            format,
            carry: Vec::with_capacity(format.bytes_per_frame()),
            next_sequence: 0,
        })
    }

    /// The declared format this buffer assembles against.
    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    /// Pushes a byte chunk and returns all complete frames it yields.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.carry.extend_from_slice(bytes);

        let frame_bytes = self.format.bytes_per_frame();
        let mut frames = Vec::with_capacity(self.carry.len() / frame_bytes);
        let mut offset = 0;
        while self.carry.len() - offset >= frame_bytes {
            let samples = bytes_to_samples(&self.carry[offset..offset + frame_bytes]);
            frames.push(AudioFrame::new(
                self.stream.clone(),
                self.next_sequence,
                samples,
            ));
            self.next_sequence += 1;
            offset += frame_bytes;
        }
        self.carry.drain(..offset);
        frames
    }

    /// Flushes the remainder at end-of-stream.
    ///
    /// A trailing partial frame of whole samples is zero-padded up to a full
    /// frame. A dangling half sample means the declared 16-bit width was
    /// inconsistent with the bytes actually sent and fails with
    /// `MalformedAudio`.
    pub fn finish(&mut self) -> Result<Option<AudioFrame>> {
        if self.carry.is_empty() {
            return Ok(None);
        }
        if self.carry.len() % defaults::SAMPLE_WIDTH != 0 {
            return Err(VoxflowError::malformed(format!(
                "{} dangling byte(s) at end of stream; not aligned to 16-bit samples",
                self.carry.len() % defaults::SAMPLE_WIDTH
            )));
        }

        let frame_bytes = self.format.bytes_per_frame();
        self.carry.resize(frame_bytes, 0);
        let samples = bytes_to_samples(&self.carry);
        self.carry.clear();
        let frame = AudioFrame::new(self.stream.clone(), self.next_sequence, samples);
        self.next_sequence += 1;
        Ok(Some(frame))
    }

    /// Sequence number the next emitted frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Decodes little-endian 16-bit PCM bytes into samples.
fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let mut buf = [0u8; 2];
            buf.copy_from_slice(chunk);
            i16::from_le_bytes(buf)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stream() -> StreamId {
        StreamId::new("test-stream")
    }

    fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_stream_id_generate_unique() {
        assert_ne!(StreamId::generate(), StreamId::generate());
    }

    #[test]
    fn test_format_default_is_valid() {
        assert!(StreamFormat::default().validate().is_ok());
    }

    #[test]
    fn test_format_rejects_bad_sample_rate() {
        let result = StreamFormat::new(44100, 1, 20);
        assert!(matches!(
            result,
            Err(VoxflowError::MalformedAudio { .. })
        ));
    }

    #[test]
    fn test_format_rejects_stereo() {
        let result = StreamFormat::new(16000, 2, 20);
        assert!(matches!(
            result,
            Err(VoxflowError::MalformedAudio { .. })
        ));
    }

    #[test]
    fn test_format_rejects_bad_frame_duration() {
        let result = StreamFormat::new(16000, 1, 25);
        assert!(matches!(
            result,
            Err(VoxflowError::MalformedAudio { .. })
        ));
    }

    #[test]
    fn test_format_frame_sizes() {
        let format = StreamFormat::default();
        assert_eq!(format.samples_per_frame(), 320);
        assert_eq!(format.bytes_per_frame(), 640);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(test_stream(), 0, vec![0i16; 16000]);
        assert_eq!(frame.duration_ms(16000), 1000);
    }

    #[test]
    fn test_push_emits_complete_frames_only() {
        let format = StreamFormat::default();
        let mut buffer = FrameBuffer::new(test_stream(), format).unwrap();

        // Half a frame: nothing emitted yet.
        let half = vec![0u8; format.bytes_per_frame() / 2];
        assert!(buffer.push(&half).is_empty());

        // Second half completes exactly one frame.
        let frames = buffer.push(&half);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[0].samples.len(), format.samples_per_frame());
    }

    #[test]
    fn test_sequences_are_contiguous() {
        let format = StreamFormat::default();
        let mut buffer = FrameBuffer::new(test_stream(), format).unwrap();

        let frames = buffer.push(&vec![0u8; format.bytes_per_frame() * 3]);
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(buffer.next_sequence(), 3);
    }

    #[test]
    fn test_chunking_invariance() {
        let format = StreamFormat::default();
        let samples: Vec<i16> = (0..format.samples_per_frame() as i16 * 5)
            .map(|i| i.wrapping_mul(37))
            .collect();
        let bytes = samples_to_bytes(&samples);

        // Reference: one giant push.
        let mut reference = FrameBuffer::new(test_stream(), format).unwrap();
        let expected = reference.push(&bytes);

        // Same bytes in awkward splits must produce the identical frames.
        for chunk_size in [1, 7, 100, 639, 641, 1000] {
            let mut buffer = FrameBuffer::new(test_stream(), format).unwrap();
            let mut frames = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                frames.extend(buffer.push(chunk));
            }
            assert_eq!(frames.len(), expected.len(), "chunk_size={}", chunk_size);
            for (got, want) in frames.iter().zip(&expected) {
                assert_eq!(got.sequence, want.sequence);
                assert_eq!(got.samples, want.samples);
            }
        }
    }

    #[test]
    fn test_finish_pads_partial_frame() {
        let format = StreamFormat::default();
        let mut buffer = FrameBuffer::new(test_stream(), format).unwrap();

        // 10 whole samples, far short of a frame.
        buffer.push(&samples_to_bytes(&[1000i16; 10]));
        let frame = buffer.finish().unwrap().expect("padded frame");
        assert_eq!(frame.samples.len(), format.samples_per_frame());
        assert_eq!(&frame.samples[..10], &[1000i16; 10]);
        assert!(frame.samples[10..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_finish_empty_is_none() {
        let mut buffer = FrameBuffer::new(test_stream(), StreamFormat::default()).unwrap();
        assert!(buffer.finish().unwrap().is_none());
    }

    #[test]
    fn test_finish_rejects_dangling_byte() {
        let mut buffer = FrameBuffer::new(test_stream(), StreamFormat::default()).unwrap();
        buffer.push(&[0u8; 3]);
        let result = buffer.finish();
        assert!(matches!(
            result,
            Err(VoxflowError::MalformedAudio { .. })
        ));
    }

    #[test]
    fn test_sample_decoding_is_little_endian() {
        let format = StreamFormat::default();
        let mut buffer = FrameBuffer::new(test_stream(), format).unwrap();

        let mut samples = vec![0i16; format.samples_per_frame()];
        samples[0] = -2;
        samples[1] = 513;
        let frames = buffer.push(&samples_to_bytes(&samples));
        assert_eq!(frames[0].samples[0], -2);
        assert_eq!(frames[0].samples[1], 513);
    }
}
