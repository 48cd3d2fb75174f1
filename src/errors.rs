use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KmerError>;

/// Failure kinds of the index and matching core.
///
/// Configuration and precondition violations are programming or build errors
/// and are returned from the offending call. Persistence faults keep the
/// loaded structure from ever being observed half-built.
#[derive(Debug, Error)]
pub enum KmerError {
    #[error("invalid k-mer length {0}, expected 1..=31")]
    InvalidK(usize),
    #[error("expected insertion count must be positive")]
    InvalidInsertions,
    #[error("false positive probability {0} outside (0, 1)")]
    InvalidFpp(f64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("store already initialized")]
    AlreadyInitialized,
    #[error("store not initialized, call init_size first")]
    NotInitialized,
    #[error("bloom filter has no storage, call ensure_capacity first")]
    NotSized,
    #[error("store capacity of {capacity} entries exceeded")]
    CapacityExceeded { capacity: usize },
    #[error("store is optimized, no further insertions allowed")]
    Sealed,
    #[error("store is not optimized, binary search unavailable")]
    NotOptimized,
    #[error("value table full ({0} distinct values)")]
    ValueTableFull(usize),

    #[error("k mismatch: index built with k={found}, requested k={expected}")]
    KMismatch { expected: usize, found: usize },
    #[error("invalid format in '{}': {detail}", path.display())]
    Format { path: PathBuf, detail: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl KmerError {
    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        KmerError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// Validates a k-mer length against the 2-bit packing limit.
pub fn check_k(k: usize) -> Result<()> {
    if k == 0 || k > crate::cgat::MAX_K {
        return Err(KmerError::InvalidK(k));
    }
    Ok(())
}
