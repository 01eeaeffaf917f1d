use crate::fork::ForkState;
use crate::reference::ChunkReference;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Out of space: no room for a {requested} byte chunk in memory or swap")]
    OutOfSpace { requested: usize },

    #[error("Chunk too long: {len} bytes (maximum {max})")]
    ChunkTooLong { len: usize, max: usize },

    #[error("Swap I/O failure for {reference}: {source}")]
    SwapIo {
        reference: ChunkReference,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid chunk reference: {0}")]
    InvalidReference(ChunkReference),

    #[error("Fork protocol violation: {operation} is not allowed while {state}")]
    ForkProtocolViolation {
        operation: &'static str,
        state: ForkState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChunkError {
    /// True for errors that only affect the single call that produced them
    ///
    /// Fork protocol violations and invalid references point at a bug in
    /// the caller and are not recoverable by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChunkError::OutOfSpace { .. } | ChunkError::SwapIo { .. } | ChunkError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChunkError>;
