//! Segment assembler: stitches classified frames into bounded speech segments.
//!
//! Per-stream state machine:
//! - `Idle`: silence frames fill a bounded pre-roll ring; a speech frame opens
//!   a segment seeded with the ring's contents.
//! - `Accumulating`: frames are appended until trailing silence outlasts the
//!   hangover, or the segment hits the duration cap (closed mid-speech so a
//!   monologue cannot grow a segment without bound).
//!
//! Closing happens synchronously inside the `push` that triggers it; there is
//! no observable intermediate state.

use crate::audio::frame::{AudioFrame, StreamId};
use crate::audio::vad::FrameClass;
use crate::defaults;
use crate::segment::Segment;
use std::collections::VecDeque;

/// Configuration for the assembler.
#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    /// Trailing silence frames tolerated before a segment closes.
    pub hangover_frames: u32,
    /// Silence frames kept as pre-roll and seeded into a new segment.
    pub pre_roll_frames: u32,
    /// Hard cap on segment duration in milliseconds.
    pub max_segment_ms: u32,
    /// Minimum speech content in milliseconds for a segment to be dispatched.
    pub min_segment_ms: u32,
    /// Sample rate of the owning stream.
    pub sample_rate: u32,
    /// Frame duration of the owning stream.
    pub frame_ms: u32,
    /// Interval between partial snapshots, in frames. `None` disables the
    /// partial-results extension.
    pub partial_interval_frames: Option<u32>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            hangover_frames: defaults::HANGOVER_FRAMES,
            pre_roll_frames: defaults::PRE_ROLL_FRAMES,
            max_segment_ms: defaults::MAX_SEGMENT_MS,
            min_segment_ms: defaults::MIN_SEGMENT_MS,
            sample_rate: defaults::SAMPLE_RATE,
            frame_ms: defaults::FRAME_MS,
            partial_interval_frames: None,
        }
    }
}

/// Observable assembler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// No active segment.
    Idle,
    /// A segment is open and absorbing frames.
    Accumulating,
}

/// Events produced while assembling.
#[derive(Debug, Clone)]
pub enum AssemblerEvent {
    /// Silence-to-speech transition observed.
    SpeechStart { sequence: u64 },
    /// Confirmed end of speech (hangover elapsed or stream ended).
    SpeechEnd { sequence: u64 },
    /// A finalized segment, ready for the scheduler.
    Closed(Segment),
    /// A partial snapshot of the accumulating segment (extension, opt-in).
    Partial(Segment),
    /// A closed segment whose speech content was below the minimum; it is
    /// reported, never dispatched.
    Discarded {
        start_sequence: u64,
        end_sequence: u64,
        speech_ms: u32,
    },
}

/// The segment under construction.
#[derive(Debug)]
struct Active {
    stream: StreamId,
    start_sequence: u64,
    end_sequence: u64,
    samples: Vec<i16>,
    speech_frames: u32,
    silence_run: u32,
    frames_since_partial: u32,
}

impl Active {
    fn append(&mut self, frame: &AudioFrame) {
        self.end_sequence = frame.sequence;
        self.samples.extend_from_slice(&frame.samples);
        self.frames_since_partial += 1;
    }

    fn snapshot(&self, sample_rate: u32, frame_ms: u32) -> Segment {
        Segment::closed(
            self.stream.clone(),
            self.start_sequence,
            self.end_sequence,
            self.samples.clone(),
            sample_rate,
            self.speech_frames * frame_ms,
            true,
        )
    }
}

/// Per-stream segment assembler.
///
/// At most one segment per stream is ever accumulating, by construction.
#[derive(Debug)]
pub struct Assembler {
    config: AssemblerConfig,
    max_samples: usize,
    pre_roll: VecDeque<AudioFrame>,
    current: Option<Active>,
    /// Tracks the silence/speech transition independently of segment state, so
    /// a cap-forced close in mid-speech does not fake a speech boundary.
    speech_live: bool,
}

impl Assembler {
    /// Creates an assembler with the given configuration.
    pub fn new(config: AssemblerConfig) -> Self {
        let max_samples =
            (config.sample_rate as u64 * config.max_segment_ms as u64 / 1000) as usize;
        Self {
            config,
            max_samples,
            pre_roll: VecDeque::with_capacity(config.pre_roll_frames as usize),
            current: None,
            speech_live: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> AssemblerState {
        if self.current.is_some() {
            AssemblerState::Accumulating
        } else {
            AssemblerState::Idle
        }
    }

    /// Feeds one classified frame through the state machine.
    pub fn push(&mut self, frame: AudioFrame, class: FrameClass) -> Vec<AssemblerEvent> {
        let mut events = Vec::new();

        if self.current.is_none() {
            match class {
                FrameClass::Silence => {
                    if self.speech_live {
                        // Speech ran past a cap-forced close and has now stopped.
                        self.speech_live = false;
                        events.push(AssemblerEvent::SpeechEnd {
                            sequence: frame.sequence.saturating_sub(1),
                        });
                    }
                    self.buffer_pre_roll(frame);
                }
                FrameClass::Speech => {
                    if !self.speech_live {
                        self.speech_live = true;
                        events.push(AssemblerEvent::SpeechStart {
                            sequence: frame.sequence,
                        });
                    }
                    self.open_segment(frame, &mut events);
                }
            }
            return events;
        }

        // Accumulating: the frame either extends the segment or confirms its end.
        let close_now = match class {
            FrameClass::Speech => {
                if let Some(active) = self.current.as_mut() {
                    active.silence_run = 0;
                    active.speech_frames += 1;
                    active.append(&frame);
                }
                false
            }
            FrameClass::Silence => {
                let hangover_spent = self
                    .current
                    .as_ref()
                    .is_some_and(|a| a.silence_run >= self.config.hangover_frames);
                if hangover_spent {
                    true
                } else {
                    if let Some(active) = self.current.as_mut() {
                        active.silence_run += 1;
                        active.append(&frame);
                    }
                    false
                }
            }
        };

        if close_now {
            // The hangover quota of trailing silence is already in the segment;
            // this frame confirms the end instead of padding it further.
            let end_sequence = self.current.as_ref().map(|a| a.end_sequence).unwrap_or(0);
            self.speech_live = false;
            events.push(AssemblerEvent::SpeechEnd {
                sequence: end_sequence,
            });
            self.close_current(&mut events);
            self.buffer_pre_roll(frame);
        } else {
            self.after_append(&mut events);
        }

        events
    }

    /// Force-closes any accumulating segment at end-of-stream.
    pub fn finish(&mut self) -> Vec<AssemblerEvent> {
        let mut events = Vec::new();
        if let Some(active) = self.current.as_ref() {
            if self.speech_live {
                self.speech_live = false;
                events.push(AssemblerEvent::SpeechEnd {
                    sequence: active.end_sequence,
                });
            }
            self.close_current(&mut events);
        }
        self.pre_roll.clear();
        events
    }

    fn buffer_pre_roll(&mut self, frame: AudioFrame) {
        if self.config.pre_roll_frames == 0 {
            return;
        }
        if self.pre_roll.len() == self.config.pre_roll_frames as usize {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame);
    }

    fn open_segment(&mut self, frame: AudioFrame, events: &mut Vec<AssemblerEvent>) {
        let start_sequence = self
            .pre_roll
            .front()
            .map(|f| f.sequence)
            .unwrap_or(frame.sequence);

        let mut samples = Vec::new();
        for padding in self.pre_roll.drain(..) {
            samples.extend_from_slice(&padding.samples);
        }
        samples.extend_from_slice(&frame.samples);

        self.current = Some(Active {
            stream: frame.stream,
            start_sequence,
            end_sequence: frame.sequence,
            samples,
            speech_frames: 1,
            silence_run: 0,
            frames_since_partial: 0,
        });
        self.after_append(events);
    }

    /// Cap and partial-snapshot checks after a frame landed in the segment.
    ///
    /// The frame that reaches the cap exactly is included in the closing
    /// segment, not deferred to the next one.
    fn after_append(&mut self, events: &mut Vec<AssemblerEvent>) {
        let at_cap = self
            .current
            .as_ref()
            .is_some_and(|active| active.samples.len() >= self.max_samples);
        if at_cap {
            self.close_current(events);
            return;
        }

        if let Some(interval) = self.config.partial_interval_frames
            && let Some(active) = self.current.as_mut()
            && active.frames_since_partial >= interval
        {
            active.frames_since_partial = 0;
            events.push(AssemblerEvent::Partial(
                active.snapshot(self.config.sample_rate, self.config.frame_ms),
            ));
        }
    }

    fn close_current(&mut self, events: &mut Vec<AssemblerEvent>) {
        let Some(active) = self.current.take() else {
            return;
        };

        let speech_ms = active.speech_frames * self.config.frame_ms;
        if speech_ms < self.config.min_segment_ms {
            events.push(AssemblerEvent::Discarded {
                start_sequence: active.start_sequence,
                end_sequence: active.end_sequence,
                speech_ms,
            });
            return;
        }

        events.push(AssemblerEvent::Closed(Segment::closed(
            active.stream,
            active.start_sequence,
            active.end_sequence,
            active.samples,
            self.config.sample_rate,
            speech_ms,
            false,
        )));
    }
}
