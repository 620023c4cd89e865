//! Inference engine seam.
//!
//! The pipeline consumes the speech model through this narrow request/response
//! contract. Calls may block; the scheduler serializes access to the engine's
//! concurrency limit, so implementations do not need internal queueing.

#[cfg(feature = "whisper")]
pub mod whisper;

use crate::error::{Result, VoxflowError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// One entry of an inference batch: the samples of a single segment.
///
/// Entries are never merged; a batch is a list of independent segments grouped
/// only to amortize engine overhead.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// 16-bit PCM mono samples.
    pub samples: Vec<i16>,
    /// Sample rate of the samples in Hz.
    pub sample_rate: u32,
}

/// The engine's answer for one batch entry.
#[derive(Debug, Clone)]
pub struct EngineHypothesis {
    /// Transcribed text.
    pub text: String,
    /// Confidence in the range 0.0 to 1.0.
    pub confidence: f32,
}

/// Trait for batch speech-to-text inference.
///
/// Implementations must return exactly one hypothesis per request, in request
/// order. Errors are classified by the voxflow taxonomy: `InferenceFailure`
/// for transient conditions worth retrying, `InferenceRejected` for input the
/// engine will never accept.
pub trait InferenceEngine: Send + Sync {
    /// Transcribes a batch of independent segments.
    fn transcribe(
        &self,
        batch: &[EngineRequest],
        language: &str,
    ) -> Result<Vec<EngineHypothesis>>;

    /// Name of the loaded model.
    fn name(&self) -> &str;

    /// Whether the engine is ready to serve.
    fn is_ready(&self) -> bool;
}

/// Allow sharing one engine across the worker pool.
impl<T: InferenceEngine + ?Sized> InferenceEngine for Arc<T> {
    fn transcribe(
        &self,
        batch: &[EngineRequest],
        language: &str,
    ) -> Result<Vec<EngineHypothesis>> {
        (**self).transcribe(batch, language)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: u64,
    transient_failures_remaining: u32,
    rejections_remaining: u32,
    scripted_delays_ms: VecDeque<u64>,
}

/// Mock engine for testing.
///
/// Supports canned responses, scripted per-call delays (to force out-of-order
/// completions), a budget of leading transient failures (to exercise retries)
/// and permanent rejection.
#[derive(Debug)]
pub struct MockEngine {
    model_name: String,
    response: String,
    reject: bool,
    default_delay: Option<Duration>,
    state: Mutex<MockState>,
}

impl MockEngine {
    /// Creates a new mock engine with default settings.
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            response: "mock transcript".to_string(),
            reject: false,
            default_delay: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Configures the text returned for every batch entry.
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Makes every call fail permanently with `InferenceRejected`.
    pub fn with_rejection(mut self) -> Self {
        self.reject = true;
        self
    }

    /// Makes the first `count` calls fail with a transient `InferenceFailure`.
    pub fn with_transient_failures(self, count: u32) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.transient_failures_remaining = count;
        }
        self
    }

    /// Makes the first `count` calls fail permanently with
    /// `InferenceRejected`; later calls succeed.
    pub fn with_rejections(self, count: u32) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.rejections_remaining = count;
        }
        self
    }

    /// Sleeps this long on every call (simulates a slow model).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// Per-call delays in milliseconds, consumed in call order. Calls beyond
    /// the script fall back to the default delay.
    pub fn with_scripted_delays(self, delays_ms: &[u64]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.scripted_delays_ms = delays_ms.iter().copied().collect();
        }
        self
    }

    /// Number of `transcribe` calls made so far.
    pub fn call_count(&self) -> u64 {
        self.state.lock().map(|s| s.calls).unwrap_or(0)
    }
}

impl InferenceEngine for MockEngine {
    fn transcribe(
        &self,
        batch: &[EngineRequest],
        _language: &str,
    ) -> Result<Vec<EngineHypothesis>> {
        let (delay, fail_transient, reject_once) = {
            let mut state = self.state.lock().map_err(|_| {
                VoxflowError::inference("mock engine state poisoned")
            })?;
            state.calls += 1;
            let delay = state
                .scripted_delays_ms
                .pop_front()
                .map(Duration::from_millis)
                .or(self.default_delay);
            let fail = if state.transient_failures_remaining > 0 {
                state.transient_failures_remaining -= 1;
                true
            } else {
                false
            };
            let reject = if state.rejections_remaining > 0 {
                state.rejections_remaining -= 1;
                true
            } else {
                false
            };
            (delay, fail, reject)
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.reject || reject_once {
            return Err(VoxflowError::rejected("mock rejection"));
        }
        if fail_transient {
            return Err(VoxflowError::inference("mock transient failure"));
        }

        Ok(batch
            .iter()
            .map(|_| EngineHypothesis {
                text: self.response.clone(),
                confidence: 0.9,
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        !self.reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EngineRequest {
        EngineRequest {
            samples: vec![1000i16; 1600],
            sample_rate: 16000,
        }
    }

    #[test]
    fn test_mock_returns_one_hypothesis_per_request() {
        let engine = MockEngine::new("mock").with_response("hello");
        let batch = vec![request(), request(), request()];
        let hypotheses = engine.transcribe(&batch, "en").unwrap();
        assert_eq!(hypotheses.len(), 3);
        assert!(hypotheses.iter().all(|h| h.text == "hello"));
    }

    #[test]
    fn test_mock_rejection() {
        let engine = MockEngine::new("mock").with_rejection();
        let result = engine.transcribe(&[request()], "en");
        assert!(matches!(
            result,
            Err(VoxflowError::InferenceRejected { .. })
        ));
        assert!(!engine.is_ready());
    }

    #[test]
    fn test_mock_transient_failures_then_success() {
        let engine = MockEngine::new("mock").with_transient_failures(2);

        assert!(engine.transcribe(&[request()], "en").is_err());
        assert!(engine.transcribe(&[request()], "en").is_err());
        assert!(engine.transcribe(&[request()], "en").is_ok());
        assert_eq!(engine.call_count(), 3);
    }

    #[test]
    fn test_mock_scripted_rejections_then_success() {
        let engine = MockEngine::new("mock").with_rejections(1);

        assert!(matches!(
            engine.transcribe(&[request()], "en"),
            Err(VoxflowError::InferenceRejected { .. })
        ));
        assert!(engine.transcribe(&[request()], "en").is_ok());
    }

    #[test]
    fn test_mock_empty_batch() {
        let engine = MockEngine::new("mock");
        let hypotheses = engine.transcribe(&[], "en").unwrap();
        assert!(hypotheses.is_empty());
    }

    #[test]
    fn test_engine_usable_through_arc() {
        let engine: Arc<dyn InferenceEngine> = Arc::new(MockEngine::new("shared"));
        assert_eq!(engine.name(), "shared");
        assert!(engine.transcribe(&[request()], "en").is_ok());
    }

    #[test]
    fn test_scripted_delays_consumed_in_order() {
        let engine = MockEngine::new("mock").with_scripted_delays(&[30, 0]);

        let start = std::time::Instant::now();
        engine.transcribe(&[request()], "en").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));

        let start = std::time::Instant::now();
        engine.transcribe(&[request()], "en").unwrap();
        assert!(start.elapsed() < Duration::from_millis(30));
    }
}
