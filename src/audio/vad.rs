//! Voice Activity Detection (VAD) module.
//!
//! Classifies each fixed-duration frame as speech or silence using RMS-based
//! thresholding, smoothed by a fixed-size ring of recent raw decisions so a
//! brief dip inside a word does not flip the classification.

use crate::audio::frame::AudioFrame;
use serde::{Deserialize, Serialize};

/// Aggressiveness of the detector.
///
/// Higher modes demand more energy and more agreeing recent frames before a
/// frame counts as speech: fewer false positives, more clipped soft speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VadMode {
    /// Most permissive: favors catching all speech.
    Quality,
    /// Slightly stricter than `Quality`.
    LowBitrate,
    /// Stricter energy gate and voting.
    #[default]
    Aggressive,
    /// Strictest: only sustained, energetic speech passes.
    VeryAggressive,
}

impl VadMode {
    /// RMS threshold (0.0 to 1.0) a frame must exceed to count as speech.
    fn threshold(self) -> f32 {
        match self {
            VadMode::Quality => 0.010,
            VadMode::LowBitrate => 0.015,
            VadMode::Aggressive => 0.020,
            VadMode::VeryAggressive => 0.030,
        }
    }

    /// Recent speech decisions required to sustain speech through a dip.
    fn votes_required(self) -> usize {
        match self {
            VadMode::Quality => 2,
            VadMode::LowBitrate => 3,
            VadMode::Aggressive => 4,
            VadMode::VeryAggressive => 6,
        }
    }
}

/// Configuration for voice activity detection.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// Aggressiveness preset.
    pub mode: VadMode,
    /// Length of the rolling decision history. Bounded by construction;
    /// the detector never retains more than this many past decisions.
    pub history: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            mode: VadMode::default(),
            history: 8,
        }
    }
}

/// Classification of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Speech,
    Silence,
}

impl FrameClass {
    pub fn is_speech(self) -> bool {
        matches!(self, FrameClass::Speech)
    }
}

/// Voice activity detector with bounded decision history.
#[derive(Debug)]
pub struct Vad {
    config: VadConfig,
    /// Ring of recent raw decisions. Fixed capacity, cursor-indexed.
    ring: Vec<bool>,
    cursor: usize,
    filled: usize,
}

impl Vad {
    /// Creates a detector with the given configuration.
    pub fn new(config: VadConfig) -> Self {
        let history = config.history.max(1);
        Self {
            config: VadConfig { history, ..config },
            ring: vec![false; history],
            cursor: 0,
            filled: 0,
        }
    }

    /// Classifies a frame as speech or silence.
    ///
    /// A frame is speech when its own energy crosses the mode threshold, or
    /// when enough recent frames did (hysteresis: keeps speech alive through
    /// short intra-word dips). O(frame length), no I/O.
    pub fn classify(&mut self, frame: &AudioFrame) -> FrameClass {
        let raw = calculate_rms(&frame.samples) > self.config.mode.threshold();

        self.ring[self.cursor] = raw;
        self.cursor = (self.cursor + 1) % self.ring.len();
        self.filled = (self.filled + 1).min(self.ring.len());

        let votes = self.ring[..self.filled].iter().filter(|&&v| v).count();
        if raw || votes >= self.config.mode.votes_required() {
            FrameClass::Speech
        } else {
            FrameClass::Silence
        }
    }

    /// Resets the decision history.
    pub fn reset(&mut self) {
        self.ring.fill(false);
        self.cursor = 0;
        self.filled = 0;
    }

    /// The configured mode.
    pub fn mode(&self) -> VadMode {
        self.config.mode
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
