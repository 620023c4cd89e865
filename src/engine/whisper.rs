//! Whisper implementation of the inference engine using whisper-rs.
//!
//! # Feature Gate
//!
//! Requires the `whisper` feature and cmake to build:
//!
//! ```bash
//! cargo build --features whisper
//! ```

use crate::engine::{EngineHypothesis, EngineRequest, InferenceEngine};
use crate::error::{Result, VoxflowError};
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Configuration for the Whisper engine.
#[derive(Debug, Clone)]
pub struct WhisperEngineConfig {
    /// Path to the ggml model file.
    pub model_path: PathBuf,
    /// Number of threads for inference (None = auto-detect).
    pub threads: Option<usize>,
}

impl Default for WhisperEngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/ggml-base.bin"),
            threads: None,
        }
    }
}

/// Whisper-backed inference engine.
///
/// The context is wrapped in a mutex: whisper state creation mutates shared
/// model buffers, so concurrent callers are serialized here as a last line of
/// defense even though the scheduler already bounds concurrency.
pub struct WhisperEngine {
    context: Mutex<WhisperContext>,
    config: WhisperEngineConfig,
    model_name: String,
}

impl std::fmt::Debug for WhisperEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperEngine")
            .field("config", &self.config)
            .field("model_name", &self.model_name)
            .field("context", &"<WhisperContext>")
            .finish()
    }
}

impl WhisperEngine {
    /// Loads the model and creates the engine.
    ///
    /// # Errors
    /// Returns `ModelNotFound` if the model file doesn't exist and
    /// `InferenceFailure` if loading fails.
    pub fn new(config: WhisperEngineConfig) -> Result<Self> {
        // Install logging hooks to suppress whisper.cpp output (only once)
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        if !config.model_path.exists() {
            return Err(VoxflowError::ModelNotFound {
                path: config.model_path.to_string_lossy().to_string(),
            });
        }

        let model_name = config
            .model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let context_params = WhisperContextParameters::default();
        let context = WhisperContext::new_with_params(
            config
                .model_path
                .to_str()
                .ok_or_else(|| VoxflowError::inference("Invalid UTF-8 in model path"))?,
            context_params,
        )
        .map_err(|e| VoxflowError::inference(format!("Failed to load Whisper model: {}", e)))?;

        Ok(Self {
            context: Mutex::new(context),
            config,
            model_name,
        })
    }

    /// Convert i16 audio samples to f32 normalized to [-1.0, 1.0].
    fn convert_audio(samples: &[i16]) -> Vec<f32> {
        samples
            .iter()
            .map(|&sample| sample as f32 / 32768.0)
            .collect()
    }

    fn transcribe_one(
        context: &WhisperContext,
        config: &WhisperEngineConfig,
        request: &EngineRequest,
        language: &str,
    ) -> Result<EngineHypothesis> {
        if request.sample_rate != 16000 {
            // whisper.cpp only accepts 16kHz input; this is a caller bug,
            // retrying will never help.
            return Err(VoxflowError::rejected(format!(
                "whisper requires 16kHz input, got {} Hz",
                request.sample_rate
            )));
        }

        let audio_f32 = Self::convert_audio(&request.samples);

        let mut state = context
            .create_state()
            .map_err(|e| VoxflowError::inference(format!("Failed to create Whisper state: {}", e)))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if language.is_empty() || language == "auto" {
            params.set_language(None);
        } else {
            params.set_language(Some(language));
        }
        if let Some(threads) = config.threads {
            params.set_n_threads(threads as i32);
        }
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &audio_f32)
            .map_err(|e| VoxflowError::inference(format!("Whisper inference failed: {}", e)))?;

        let mut text = String::new();
        let mut confidence_sum = 0.0_f32;
        let mut segment_count = 0u32;
        for segment in state.as_iter() {
            text.push_str(&segment.to_string());
            // no_speech_probability is 0.0..1.0; confidence = 1 - no_speech_prob
            confidence_sum += 1.0 - segment.no_speech_probability();
            segment_count += 1;
        }

        let confidence = if segment_count > 0 {
            (confidence_sum / segment_count as f32).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Ok(EngineHypothesis {
            text: text.trim().to_string(),
            confidence,
        })
    }
}

impl InferenceEngine for WhisperEngine {
    fn transcribe(
        &self,
        batch: &[EngineRequest],
        language: &str,
    ) -> Result<Vec<EngineHypothesis>> {
        let context = self
            .context
            .lock()
            .map_err(|e| VoxflowError::inference(format!("Failed to acquire context lock: {}", e)))?;

        batch
            .iter()
            .map(|request| Self::transcribe_one(&context, &self.config, request, language))
            .collect()
    }

    fn name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        true
    }
}
