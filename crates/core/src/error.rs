use thiserror::Error;

/// Fatal pipeline failures.
///
/// Raised through `anyhow`; callers that need the category can
/// `downcast_ref::<UpscaleError>()` on the returned error. Nothing is retried:
/// tiling is deterministic, so a retry reproduces the same failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpscaleError {
    /// Grid or buffer geometry cannot be computed for the requested sizes.
    #[error("tiling geometry error: {0}")]
    Geometry(String),

    /// The inference capability failed or returned a tensor of the wrong shape.
    #[error("inference failed on tile ({row}, {col}) of stage '{stage}': {message}")]
    Inference {
        stage: String,
        row: usize,
        col: usize,
        message: String,
    },

    /// No valid stage list exists for the requested configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl UpscaleError {
    pub fn geometry(message: impl Into<String>) -> Self {
        Self::Geometry(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
