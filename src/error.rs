use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FwdtiError {
    /// the acquisition or the model parameters cannot support a fit. Raised before any voxel is touched
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("bad cfl file {path}: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("shape mismatch: {0}")]
    Shape(String),
}

impl FwdtiError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FwdtiError>;
