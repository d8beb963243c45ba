use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported acquisition format: {0}")]
    UnsupportedFormat(String),

    #[error("read failed (fov {fov}, channel {channel}, frame {frame}): {message}")]
    Read {
        fov: usize,
        channel: usize,
        frame: usize,
        message: String,
    },

    #[error("write failed at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt artifact {path}: {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },

    #[error("incompatible artifact {path}: {reason}")]
    IncompatibleArtifact { path: PathBuf, reason: String },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("dtype mismatch: {0}")]
    DType(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
