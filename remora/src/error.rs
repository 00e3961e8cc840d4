use thiserror::Error;

use crate::{analyzer::AnalyzerError, runtime::conf::ConfError};

/// Main application error type for remora.
#[derive(Debug, Error)]
pub enum RemoraError {
    /// Configuration loading/validation errors
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),

    /// Analyzer pipeline errors
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    /// Event source I/O errors
    #[error("source error: {0}")]
    Source(#[from] std::io::Error),
}

/// Type alias for Result with RemoraError
pub type Result<T> = std::result::Result<T, RemoraError>;
