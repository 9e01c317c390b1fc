use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already in flight: {0}")]
    InFlight(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("received NACK from {0}")]
    Nack(String),

    #[error("part {1} of {0} failed after {2} attempts")]
    PartExhausted(String, i64, usize),

    #[error("assembly failed: {0}")]
    AssemblyFailed(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}
