//! Per-stream session state.
//!
//! One owned record per connection: frame buffer, VAD history and assembler
//! live together and die together, so nothing about a stream leaks past its
//! close and no two streams can alias each other's state. The session is the
//! synchronous core the per-stream pipeline task drives.

use crate::audio::frame::{FrameBuffer, StreamFormat, StreamId};
use crate::audio::vad::{Vad, VadConfig};
use crate::error::Result;
use crate::segment::{Assembler, AssemblerConfig, AssemblerEvent, AssemblerState};

/// Owned processing state for one audio stream.
pub struct StreamSession {
    id: StreamId,
    frames: FrameBuffer,
    vad: Vad,
    assembler: Assembler,
}

impl StreamSession {
    /// Creates the session for a declared, validated stream format.
    pub fn new(
        id: StreamId,
        format: StreamFormat,
        vad: VadConfig,
        assembler: AssemblerConfig,
    ) -> Result<Self> {
        Ok(Self {
            frames: FrameBuffer::new(id.clone(), format)?,
            id,
            vad: Vad::new(vad),
            assembler: Assembler::new(assembler),
        })
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn format(&self) -> &StreamFormat {
        self.frames.format()
    }

    /// Whether a segment is currently accumulating.
    pub fn state(&self) -> AssemblerState {
        self.assembler.state()
    }

    /// Runs one inbound byte chunk through framing, VAD and assembly.
    ///
    /// Purely synchronous; any chunking of the same byte stream produces the
    /// identical event sequence.
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<AssemblerEvent> {
        let mut events = Vec::new();
        for frame in self.frames.push(bytes) {
            let class = self.vad.classify(&frame);
            events.extend(self.assembler.push(frame, class));
        }
        events
    }

    /// Flushes the remainder and force-closes any accumulating segment at
    /// end-of-stream.
    ///
    /// A byte stream that does not align to whole 16-bit samples fails with
    /// `MalformedAudio`; the assembler is still reset first so the session
    /// can never be dropped with a dangling segment.
    pub fn finish(&mut self) -> Result<Vec<AssemblerEvent>> {
        let tail = self.frames.finish();
        let mut events = Vec::new();
        if let Ok(Some(frame)) = &tail {
            let class = self.vad.classify(frame);
            events.extend(self.assembler.push(frame.clone(), class));
        }
        events.extend(self.assembler.finish());
        tail?;
        Ok(events)
    }
}
