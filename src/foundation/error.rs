use crate::foundation::core::FrameIndex;
use crate::pipeline::state::PipelineState;

/// Convenience result type used across sketchreel.
pub type SketchResult<T> = Result<T, SketchError>;

/// Top-level error taxonomy surfaced to the pipeline controller.
#[derive(thiserror::Error, Debug)]
pub enum SketchError {
    /// Persisting a frame to storage failed; the session cannot compose until retry or clear.
    #[error("frame write failed: frame {index}: {reason}")]
    FrameWriteFailed {
        /// Frame whose write failed.
        index: FrameIndex,
        /// Underlying I/O or codec failure.
        reason: String,
    },

    /// A frame outside the persisted range was requested.
    #[error("frame not found: {0}")]
    FrameNotFound(FrameIndex),

    /// The audio session could not be opened.
    #[error("audio configuration failed: {0}")]
    AudioConfigurationFailed(String),

    /// The audio session did not produce a usable track.
    #[error("audio finalize failed: {0}")]
    AudioFinalizeFailed(String),

    /// Nothing to compose: zero frames or zero audio duration.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// No pixel buffer became available before the acquisition timeout.
    #[error("buffer pool exhausted: {0}")]
    BufferPoolExhausted(String),

    /// The encoder rejected a frame or the frame could not be prepared.
    #[error("encoder write failed: {0}")]
    EncoderWriteFailed(String),

    /// The encoder could not finalize the output asset.
    #[error("encoder finalize failed: {0}")]
    EncoderFinalizeFailed(String),

    /// The save collaborator was denied write access to the library.
    #[error("save permission denied")]
    SavePermissionDenied,

    /// Invalid caller-provided data or options.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested action is not allowed in the current pipeline state.
    #[error("invalid transition: cannot {action} while {from:?}")]
    InvalidTransition {
        /// State the pipeline was in.
        from: PipelineState,
        /// Action that was attempted.
        action: &'static str,
    },

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Wrapped lower-level error from dependencies or IO.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable classification of [`SketchError`] for user-facing messaging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// See [`SketchError::FrameWriteFailed`].
    FrameWriteFailed,
    /// See [`SketchError::FrameNotFound`].
    FrameNotFound,
    /// See [`SketchError::AudioConfigurationFailed`].
    AudioConfigurationFailed,
    /// See [`SketchError::AudioFinalizeFailed`].
    AudioFinalizeFailed,
    /// See [`SketchError::EmptyInput`].
    EmptyInput,
    /// See [`SketchError::BufferPoolExhausted`].
    BufferPoolExhausted,
    /// See [`SketchError::EncoderWriteFailed`].
    EncoderWriteFailed,
    /// See [`SketchError::EncoderFinalizeFailed`].
    EncoderFinalizeFailed,
    /// See [`SketchError::SavePermissionDenied`].
    SavePermissionDenied,
    /// See [`SketchError::Validation`].
    Validation,
    /// See [`SketchError::InvalidTransition`].
    InvalidTransition,
    /// See [`SketchError::Cancelled`].
    Cancelled,
    /// See [`SketchError::Other`].
    Other,
}

impl SketchError {
    /// Build a [`SketchError::FrameWriteFailed`] value.
    pub fn frame_write(index: FrameIndex, reason: impl Into<String>) -> Self {
        Self::FrameWriteFailed {
            index,
            reason: reason.into(),
        }
    }

    /// Build a [`SketchError::AudioConfigurationFailed`] value.
    pub fn audio_configuration(msg: impl Into<String>) -> Self {
        Self::AudioConfigurationFailed(msg.into())
    }

    /// Build a [`SketchError::AudioFinalizeFailed`] value.
    pub fn audio_finalize(msg: impl Into<String>) -> Self {
        Self::AudioFinalizeFailed(msg.into())
    }

    /// Build a [`SketchError::EmptyInput`] value.
    pub fn empty_input(msg: impl Into<String>) -> Self {
        Self::EmptyInput(msg.into())
    }

    /// Build a [`SketchError::BufferPoolExhausted`] value.
    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::BufferPoolExhausted(msg.into())
    }

    /// Build a [`SketchError::EncoderWriteFailed`] value.
    pub fn encoder_write(msg: impl Into<String>) -> Self {
        Self::EncoderWriteFailed(msg.into())
    }

    /// Build a [`SketchError::EncoderFinalizeFailed`] value.
    pub fn encoder_finalize(msg: impl Into<String>) -> Self {
        Self::EncoderFinalizeFailed(msg.into())
    }

    /// Build a [`SketchError::Validation`] value.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FrameWriteFailed { .. } => ErrorKind::FrameWriteFailed,
            Self::FrameNotFound(_) => ErrorKind::FrameNotFound,
            Self::AudioConfigurationFailed(_) => ErrorKind::AudioConfigurationFailed,
            Self::AudioFinalizeFailed(_) => ErrorKind::AudioFinalizeFailed,
            Self::EmptyInput(_) => ErrorKind::EmptyInput,
            Self::BufferPoolExhausted(_) => ErrorKind::BufferPoolExhausted,
            Self::EncoderWriteFailed(_) => ErrorKind::EncoderWriteFailed,
            Self::EncoderFinalizeFailed(_) => ErrorKind::EncoderFinalizeFailed,
            Self::SavePermissionDenied => ErrorKind::SavePermissionDenied,
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Return `true` when re-running the compositor against the same frames may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BufferPoolExhausted(_)
                | Self::EncoderWriteFailed(_)
                | Self::EncoderFinalizeFailed(_)
        )
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
