use thiserror::Error;

/// Failure kinds of the wavelet/tiling core.
///
/// Shape and window errors are programmer errors: they mean the pipeline is
/// misconfigured and are surfaced immediately, never coerced.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WaveletError {
    #[error("shape error: {0}")]
    Shape(String),

    #[error("wavelet pyramid has no levels")]
    EmptyPyramid,

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("checkpoint load failed at '{key}': {reason}")]
    CheckpointLoad { key: String, reason: String },
}

impl WaveletError {
    pub fn shape(msg: impl Into<String>) -> Self {
        WaveletError::Shape(msg.into())
    }

    pub fn checkpoint(key: impl Into<String>, reason: impl Into<String>) -> Self {
        WaveletError::CheckpointLoad {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type WaveletResult<T> = std::result::Result<T, WaveletError>;
