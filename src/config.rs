//! Configuration: TOML file plus environment overrides.
//!
//! Every section has serde defaults so a partial file only overrides what it
//! names. `validate()` rejects combinations the pipeline cannot run with
//! before any stream is opened.

use crate::audio::frame::StreamFormat;
use crate::audio::vad::{VadConfig, VadMode};
use crate::defaults;
use crate::error::{Result, VoxflowError};
use crate::publish::PublisherConfig;
use crate::schedule::{OverloadPolicy, SchedulerConfig};
use crate::segment::AssemblerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioSection,
    pub vad: VadSection,
    pub segmenter: SegmenterSection,
    pub scheduler: SchedulerSection,
    pub publisher: PublisherSection,
    pub partials: PartialsSection,
    pub stt: SttSection,
}

/// Inbound audio format expectations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSection {
    pub sample_rate: u32,
    pub frame_ms: u32,
}

/// Voice activity detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSection {
    pub mode: VadMode,
    pub history: usize,
}

/// Segment assembly thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmenterSection {
    pub hangover_frames: u32,
    pub pre_roll_frames: u32,
    pub max_segment_ms: u32,
    pub min_segment_ms: u32,
}

/// Scheduler capacity and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_concurrent_jobs: usize,
    pub queue_depth: usize,
    pub overload_policy: OverloadPolicy,
    pub submit_timeout_ms: u64,
    pub batch_coalesce_ms: u64,
    pub batch_max_duration_ms: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub inference_timeout_ms: u64,
}

/// Result publication bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublisherSection {
    pub reorder_buffer_bound: usize,
    pub transcript_topic: String,
}

/// Partial-transcript extension. Off by default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartialsSection {
    pub enabled: bool,
    pub interval_ms: u32,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SttSection {
    pub model: String,
    pub language: String,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            frame_ms: defaults::FRAME_MS,
        }
    }
}

impl Default for VadSection {
    fn default() -> Self {
        let vad = VadConfig::default();
        Self {
            mode: vad.mode,
            history: vad.history,
        }
    }
}

impl Default for SegmenterSection {
    fn default() -> Self {
        Self {
            hangover_frames: defaults::HANGOVER_FRAMES,
            pre_roll_frames: defaults::PRE_ROLL_FRAMES,
            max_segment_ms: defaults::MAX_SEGMENT_MS,
            min_segment_ms: defaults::MIN_SEGMENT_MS,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: defaults::MAX_CONCURRENT_JOBS,
            queue_depth: defaults::QUEUE_DEPTH,
            overload_policy: OverloadPolicy::default(),
            submit_timeout_ms: defaults::SUBMIT_TIMEOUT_MS,
            batch_coalesce_ms: defaults::BATCH_COALESCE_MS,
            batch_max_duration_ms: defaults::BATCH_MAX_DURATION_MS,
            max_retries: defaults::MAX_RETRIES,
            retry_backoff_ms: defaults::RETRY_BACKOFF_MS,
            inference_timeout_ms: defaults::INFERENCE_TIMEOUT_MS,
        }
    }
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            reorder_buffer_bound: defaults::REORDER_BUFFER_BOUND,
            transcript_topic: defaults::TRANSCRIPT_TOPIC.to_string(),
        }
    }
}

impl Default for PartialsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: defaults::PARTIAL_INTERVAL_MS,
        }
    }
}

impl Default for SttSection {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file cannot be read or contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                VoxflowError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                VoxflowError::Io(error)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if it is missing.
    ///
    /// Invalid TOML is still an error; only absence falls back.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(VoxflowError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(error) => Err(error),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXFLOW_MODEL → stt.model
    /// - VOXFLOW_LANGUAGE → stt.language
    /// - VOXFLOW_VAD_MODE → vad.mode
    /// - VOXFLOW_MAX_CONCURRENT_JOBS → scheduler.max_concurrent_jobs
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("VOXFLOW_MODEL")
            && !model.is_empty()
        {
            self.stt.model = model;
        }

        if let Ok(language) = std::env::var("VOXFLOW_LANGUAGE")
            && !language.is_empty()
        {
            self.stt.language = language;
        }

        if let Ok(mode) = std::env::var("VOXFLOW_VAD_MODE")
            && let Ok(mode) = serde_json::from_value(serde_json::Value::String(mode))
        {
            self.vad.mode = mode;
        }

        if let Ok(jobs) = std::env::var("VOXFLOW_MAX_CONCURRENT_JOBS")
            && let Ok(jobs) = jobs.parse()
        {
            self.scheduler.max_concurrent_jobs = jobs;
        }

        self
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.stream_format().validate()?;

        if self.segmenter.min_segment_ms >= self.segmenter.max_segment_ms {
            return Err(VoxflowError::ConfigInvalidValue {
                key: "segmenter.min_segment_ms".to_string(),
                message: format!(
                    "minimum segment ({}ms) must be below the maximum ({}ms)",
                    self.segmenter.min_segment_ms, self.segmenter.max_segment_ms
                ),
            });
        }
        if self.segmenter.max_segment_ms < self.audio.frame_ms {
            return Err(VoxflowError::ConfigInvalidValue {
                key: "segmenter.max_segment_ms".to_string(),
                message: "maximum segment is shorter than one frame".to_string(),
            });
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(VoxflowError::ConfigInvalidValue {
                key: "scheduler.max_concurrent_jobs".to_string(),
                message: "at least one worker is required".to_string(),
            });
        }
        if self.scheduler.queue_depth == 0 {
            return Err(VoxflowError::ConfigInvalidValue {
                key: "scheduler.queue_depth".to_string(),
                message: "queue depth must be at least one".to_string(),
            });
        }
        if self.publisher.reorder_buffer_bound == 0 {
            return Err(VoxflowError::ConfigInvalidValue {
                key: "publisher.reorder_buffer_bound".to_string(),
                message: "the reorder buffer needs room for at least one result".to_string(),
            });
        }
        if self.partials.enabled && self.partials.interval_ms < self.audio.frame_ms {
            return Err(VoxflowError::ConfigInvalidValue {
                key: "partials.interval_ms".to_string(),
                message: "partial interval is shorter than one frame".to_string(),
            });
        }
        Ok(())
    }

    /// The stream format every connection must declare, per this config.
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.audio.sample_rate,
            channels: 1,
            frame_ms: self.audio.frame_ms,
        }
    }

    /// VAD settings for a new stream.
    pub fn vad_config(&self) -> VadConfig {
        VadConfig {
            mode: self.vad.mode,
            history: self.vad.history,
        }
    }

    /// Assembler settings for a new stream.
    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            hangover_frames: self.segmenter.hangover_frames,
            pre_roll_frames: self.segmenter.pre_roll_frames,
            max_segment_ms: self.segmenter.max_segment_ms,
            min_segment_ms: self.segmenter.min_segment_ms,
            sample_rate: self.audio.sample_rate,
            frame_ms: self.audio.frame_ms,
            partial_interval_frames: self
                .partials
                .enabled
                .then(|| (self.partials.interval_ms / self.audio.frame_ms).max(1)),
        }
    }

    /// Shared scheduler settings.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs: self.scheduler.max_concurrent_jobs,
            queue_depth: self.scheduler.queue_depth,
            overload_policy: self.scheduler.overload_policy,
            submit_timeout: Duration::from_millis(self.scheduler.submit_timeout_ms),
            batch_coalesce: Duration::from_millis(self.scheduler.batch_coalesce_ms),
            batch_max_duration_ms: self.scheduler.batch_max_duration_ms,
            max_retries: self.scheduler.max_retries,
            retry_backoff: Duration::from_millis(self.scheduler.retry_backoff_ms),
            inference_timeout: Duration::from_millis(self.scheduler.inference_timeout_ms),
            language: self.stt.language.clone(),
        }
    }

    /// Shared publisher settings.
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            reorder_buffer_bound: self.publisher.reorder_buffer_bound,
            transcript_topic: self.publisher.transcript_topic.clone(),
        }
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxflow/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> std::path::PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("voxflow")
            .join("config.toml")
    }
}
