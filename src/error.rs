//! Error types for voxflow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxflowError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Stream input errors — fatal to the offending stream only
    #[error("Malformed audio: {message}")]
    MalformedAudio { message: String },

    // Scheduler backpressure — recoverable, caller may retry with backoff
    #[error("Scheduler overloaded: no queue capacity after {waited_ms}ms")]
    Overloaded { waited_ms: u64 },

    // Inference errors: transient failures are retried, rejections are not
    #[error("Inference failed: {message}")]
    InferenceFailure { message: String },

    #[error("Inference rejected input: {message}")]
    InferenceRejected { message: String },

    #[error("Inference model not found at {path}")]
    ModelNotFound { path: String },

    // Sink errors — isolated per sink, never cascade
    #[error("Delivery to {sink} sink failed: {message}")]
    DeliveryFailure { sink: String, message: String },

    // Lifecycle errors
    #[error("Stream {stream} is closed")]
    StreamClosed { stream: String },

    #[error("Pipeline error: {message}")]
    Pipeline { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoxflowError {
    /// Whether the scheduler may retry the operation that produced this error.
    ///
    /// Only transient inference failures qualify; rejections and malformed
    /// input are permanent by definition.
    pub fn is_transient(&self) -> bool {
        matches!(self, VoxflowError::InferenceFailure { .. })
    }

    /// Shorthand for a transient inference failure.
    pub fn inference(message: impl Into<String>) -> Self {
        VoxflowError::InferenceFailure {
            message: message.into(),
        }
    }

    /// Shorthand for a permanent inference rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        VoxflowError::InferenceRejected {
            message: message.into(),
        }
    }

    /// Shorthand for a malformed-audio error.
    pub fn malformed(message: impl Into<String>) -> Self {
        VoxflowError::MalformedAudio {
            message: message.into(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxflowError>;
