//! Face embedding extraction.
//!
//! Two interchangeable strategies produce unit-length vectors from a face
//! detection: [`GeometricExtractor`] (landmark-distance ratios, no model) and
//! [`LearnedExtractor`](crate::learned::LearnedExtractor) (face crop through an
//! external CNN). Their vectors live in different spaces and are never
//! compared with each other.

use crate::geometry::distance;
use crate::learned::InferenceError;
use crate::types::{Embedding, EmbeddingScheme, FaceDetection, Frame, Landmark};
use thiserror::Error;

/// Below this inter-ocular distance (pixels) the face is too small or too far
/// for stable ratios.
pub const MIN_INTER_OCULAR_PX: f32 = 10.0;

const POSE_SCALE_DEG: f32 = 90.0;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("missing landmark: {0}")]
    MissingLandmark(Landmark),
    #[error("face too small: inter-ocular distance {inter_ocular:.1}px")]
    FaceTooSmall { inter_ocular: f32 },
    #[error("frame carries no pixels for the learned extractor")]
    NoImage,
    #[error("face crop is empty after clamping to the frame")]
    EmptyCrop,
    #[error("expected {expected}-dim embedding, got {actual}")]
    UnexpectedDimensions { expected: usize, actual: usize },
    #[error("embedding has zero norm")]
    DegenerateVector,
    #[error("inference: {0}")]
    Inference(#[from] InferenceError),
}

/// Strategy that turns one detected face into an [`Embedding`].
pub trait EmbeddingExtractor {
    fn scheme(&self) -> EmbeddingScheme;

    fn extract(&mut self, frame: &Frame, face: &FaceDetection) -> Result<Embedding, ExtractionError>;
}

/// Landmark-ratio embedding. Scale invariant: every distance is divided by
/// the inter-ocular distance.
#[derive(Debug, Clone)]
pub struct GeometricExtractor {
    min_inter_ocular: f32,
}

impl Default for GeometricExtractor {
    fn default() -> Self {
        Self {
            min_inter_ocular: MIN_INTER_OCULAR_PX,
        }
    }
}

impl GeometricExtractor {
    pub fn new(min_inter_ocular: f32) -> Self {
        Self { min_inter_ocular }
    }

    /// Raw (un-normalized) ratio vector.
    pub fn ratios(&self, face: &FaceDetection) -> Result<Vec<f32>, ExtractionError> {
        let lm = face.landmarks.core()?;

        let d_eye = lm.inter_ocular();
        if d_eye < self.min_inter_ocular {
            return Err(ExtractionError::FaceTooSmall { inter_ocular: d_eye });
        }

        let eye_center = lm.eye_center();
        let mouth_center = lm.mouth_center();

        let mut v: Vec<f32> = [
            distance(eye_center, lm.nose_base),
            distance(lm.nose_base, mouth_center),
            distance(mouth_center, lm.bottom_mouth),
            distance(eye_center, mouth_center),
            distance(lm.left_mouth, lm.right_mouth),
            distance(lm.left_eye, lm.nose_base),
            distance(lm.right_eye, lm.nose_base),
            distance(lm.left_eye, lm.left_mouth),
            distance(lm.right_eye, lm.right_mouth),
            distance(lm.nose_base, lm.left_mouth),
            distance(lm.nose_base, lm.right_mouth),
        ]
        .iter()
        .map(|d| d / d_eye)
        .collect();

        // Pose dims are always present so the vector length stays fixed.
        v.push(face.landmarks.yaw.unwrap_or(0.0) / POSE_SCALE_DEG);
        v.push(face.landmarks.pitch.unwrap_or(0.0) / POSE_SCALE_DEG);

        debug_assert_eq!(v.len(), EmbeddingScheme::Geometric.dimensions());
        Ok(v)
    }
}

impl EmbeddingExtractor for GeometricExtractor {
    fn scheme(&self) -> EmbeddingScheme {
        EmbeddingScheme::Geometric
    }

    fn extract(&mut self, _frame: &Frame, face: &FaceDetection) -> Result<Embedding, ExtractionError> {
        let raw = self.ratios(face)?;
        Embedding::normalized(raw, EmbeddingScheme::Geometric)
    }
}
