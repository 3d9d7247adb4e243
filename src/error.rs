//! Crate-wide error type.
//!
//! Variants follow the failure classes of the pipeline so callers can react to
//! them individually (e.g. retry a grid build with corrected bounds), and every
//! variant maps onto a process exit code for the `multicube` binary.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CubeError {
    /// A required input or previous step is missing (no guess grid, no model grid, ...).
    #[error("{0}")]
    Precondition(String),

    /// Array shapes do not agree with each other or with the cube.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Some minimal parameter values are larger than the maximal ones.
    #[error("Minimal parameters exceed maximal ones for parameter(s) {dims:?}")]
    InvalidBounds { dims: Vec<usize> },

    /// A scalar input is out of its valid range.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A recognised but unimplemented input layout (spatially varying grids).
    #[error("Not supported yet: {0}")]
    NotSupported(String),

    /// Spectral unit conversion failed; the message carries the configuration hint.
    #[error("Cannot convert from '{from}' to '{to}': {hint}")]
    UnitConversion {
        from: String,
        to: String,
        hint: String,
    },

    /// An allocation needed by a residual tier could not be satisfied.
    #[error("Not enough memory: {0}")]
    ResourceExhausted(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Array file '{path}': {message}")]
    Npy { path: PathBuf, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The fitting backend failed (thread pool, numerical setup, ...).
    #[error("Fit failed: {0}")]
    Fit(String),
}

impl CubeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn npy(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Npy {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Exit code used by the binary: 2 for bad input, 3 for missing
    /// prerequisites, 4 for computation and I/O failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            CubeError::InvalidShape(_)
            | CubeError::InvalidBounds { .. }
            | CubeError::InvalidInput(_)
            | CubeError::NotSupported(_)
            | CubeError::UnitConversion { .. } => 2,
            CubeError::Precondition(_) => 3,
            CubeError::ResourceExhausted(_)
            | CubeError::Io { .. }
            | CubeError::Npy { .. }
            | CubeError::Json(_)
            | CubeError::Fit(_) => 4,
        }
    }
}
