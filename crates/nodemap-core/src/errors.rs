//! Error types for the nodemap core library.

use std::path::PathBuf;

/// Top-level error enum for the nodemap core library.
#[derive(Debug, thiserror::Error)]
pub enum NodemapError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Failed to persist {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("Input file not found: {0}")]
    MissingInput(PathBuf),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(feature = "python")]
impl From<NodemapError> for pyo3::PyErr {
    fn from(err: NodemapError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyFileNotFoundError, PyIOError, PyRuntimeError, PyValueError};

        match &err {
            NodemapError::Config(_) | NodemapError::InvalidValue { .. } => {
                PyValueError::new_err(err.to_string())
            }
            NodemapError::Fetch(_) | NodemapError::Http(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
            NodemapError::Persist { .. } | NodemapError::Io(_) => {
                PyIOError::new_err(err.to_string())
            }
            NodemapError::MissingInput(_) => PyFileNotFoundError::new_err(err.to_string()),
            NodemapError::InvalidData(_) | NodemapError::Json(_) => {
                PyValueError::new_err(err.to_string())
            }
        }
    }
}

pub type NodemapResult<T> = Result<T, NodemapError>;
