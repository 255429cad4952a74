use thiserror::Error;

/// Aiding layer error types
///
/// Arbitration decisions are never errors; these cover construction and I/O.
#[derive(Error, Debug)]
pub enum AidingError {
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Sample buffer capacity must be non-zero")]
    ZeroCapacity,

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type AidingResult<T> = Result<T, AidingError>;
