use image::GrayImage;
use image_compare::Algorithm;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimilarityError {
    /// The measure ran but produced no usable number.
    #[error("Degenerate similarity score: {score}")]
    Degenerate { score: f64 },

    #[error("Image comparison failed: {0}")]
    Comparison(String),
}

impl SimilarityError {
    /// Degenerate scores are absorbed by the detector, which keeps its last
    /// score; anything else reaches the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SimilarityError::Degenerate { .. })
    }
}

/// Structural similarity between the reference frame and the current frame.
/// 1.0 means identical.
pub trait SimilarityMeasure: Send {
    fn score(&self, reference: &GrayImage, current: &GrayImage) -> Result<f64, SimilarityError>;
}

/// Mean SSIM over 8x8 windows with the usual constants (K1 = 0.01,
/// K2 = 0.03, L = 255).
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanStructuralSimilarity;

impl SimilarityMeasure for MeanStructuralSimilarity {
    fn score(&self, reference: &GrayImage, current: &GrayImage) -> Result<f64, SimilarityError> {
        let similarity = image_compare::gray_similarity_structure(&Algorithm::MSSIMSimple, reference, current)
            .map_err(|e| SimilarityError::Comparison(format!("{:?}", e)))?;

        if !similarity.score.is_finite() {
            return Err(SimilarityError::Degenerate {
                score: similarity.score,
            });
        }

        Ok(similarity.score)
    }
}
