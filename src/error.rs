use crate::similarity::SimilarityError;

pub type Result<T> = std::result::Result<T, DetectorError>;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Frame size mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Structural similarity failed: {0}")]
    Similarity(#[from] SimilarityError),
}
