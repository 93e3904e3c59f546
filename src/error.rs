use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DatasetError>;

/// Errors raised by the dataset stages.
///
/// Per-item anomalies (a missing `gt.yml`, an unmapped class) are logged and
/// skipped by the callers; only the variants that break a global invariant
/// (`Copy`, `EmptyCorpus`) abort a stage.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml parse error at {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unrecognized ground truth format in {path}: {detail}")]
    UnrecognizedFormat { path: PathBuf, detail: String },
    #[error("ground truth file {path} is empty")]
    EmptyGroundTruth { path: PathBuf },
    #[error("not a rotation matrix (det = {det:.6}, orthogonality error = {orthogonality_error:.6})")]
    InvalidRotation {
        det: f64,
        orthogonality_error: f64,
    },
    #[error("no images found for split under {root}")]
    EmptyCorpus { root: PathBuf },
    #[error("invalid configuration value for {field}: {detail}")]
    InvalidConfig { field: String, detail: String },
}

impl DatasetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }
}
