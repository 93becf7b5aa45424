use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::ExtractionError;
use crate::geometry;

/// A 2D image coordinate in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Bounding box for a detected face in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// The facial points the core reads from the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landmark {
    LeftEye,
    RightEye,
    NoseBase,
    LeftMouth,
    RightMouth,
    BottomMouth,
}

impl std::fmt::Display for Landmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Landmark::LeftEye => "left eye",
            Landmark::RightEye => "right eye",
            Landmark::NoseBase => "nose base",
            Landmark::LeftMouth => "left mouth corner",
            Landmark::RightMouth => "right mouth corner",
            Landmark::BottomMouth => "bottom mouth",
        };
        f.write_str(name)
    }
}

/// Per-face detector output. Every field is optional because detectors only
/// report what they could locate or classify in a given frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    #[serde(default)]
    pub left_eye: Option<Point>,
    #[serde(default)]
    pub right_eye: Option<Point>,
    #[serde(default)]
    pub nose_base: Option<Point>,
    #[serde(default)]
    pub left_mouth: Option<Point>,
    #[serde(default)]
    pub right_mouth: Option<Point>,
    #[serde(default)]
    pub bottom_mouth: Option<Point>,
    /// Head yaw in degrees.
    #[serde(default)]
    pub yaw: Option<f32>,
    /// Head pitch in degrees.
    #[serde(default)]
    pub pitch: Option<f32>,
    #[serde(default)]
    pub left_eye_open: Option<f32>,
    #[serde(default)]
    pub right_eye_open: Option<f32>,
    #[serde(default)]
    pub smiling: Option<f32>,
}

/// The six landmarks the geometric embedding needs, all present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose_base: Point,
    pub left_mouth: Point,
    pub right_mouth: Point,
    pub bottom_mouth: Point,
}

impl CoreLandmarks {
    pub fn eye_center(&self) -> Point {
        geometry::midpoint(self.left_eye, self.right_eye)
    }

    pub fn mouth_center(&self) -> Point {
        geometry::midpoint(self.left_mouth, self.right_mouth)
    }

    pub fn inter_ocular(&self) -> f32 {
        geometry::distance(self.left_eye, self.right_eye)
    }
}

impl LandmarkSet {
    /// Validate that every core landmark is present.
    pub fn core(&self) -> Result<CoreLandmarks, ExtractionError> {
        let need = |p: Option<Point>, which: Landmark| p.ok_or(ExtractionError::MissingLandmark(which));
        Ok(CoreLandmarks {
            left_eye: need(self.left_eye, Landmark::LeftEye)?,
            right_eye: need(self.right_eye, Landmark::RightEye)?,
            nose_base: need(self.nose_base, Landmark::NoseBase)?,
            left_mouth: need(self.left_mouth, Landmark::LeftMouth)?,
            right_mouth: need(self.right_mouth, Landmark::RightMouth)?,
            bottom_mouth: need(self.bottom_mouth, Landmark::BottomMouth)?,
        })
    }

    /// Both eyes reported closed (open probability below `threshold`).
    pub fn eyes_closed(&self, threshold: f32) -> bool {
        matches!(
            (self.left_eye_open, self.right_eye_open),
            (Some(l), Some(r)) if l < threshold && r < threshold
        )
    }

    /// Either eye reported open (open probability above `threshold`).
    pub fn either_eye_open(&self, threshold: f32) -> bool {
        self.left_eye_open.is_some_and(|p| p > threshold)
            || self.right_eye_open.is_some_and(|p| p > threshold)
    }
}

/// One face found by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bounds: BoundingBox,
    #[serde(default)]
    pub landmarks: LandmarkSet,
}

/// One frame from the frame source: detections plus optional pixels for the
/// learned embedding strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub faces: Vec<FaceDetection>,
    #[serde(skip)]
    pub image: Option<RgbImage>,
}

/// Which extraction strategy produced an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingScheme {
    /// Landmark-distance ratios, no model.
    Geometric,
    /// CNN embedding from a cropped face.
    Learned,
}

impl EmbeddingScheme {
    pub const fn dimensions(self) -> usize {
        match self {
            EmbeddingScheme::Geometric => 13,
            EmbeddingScheme::Learned => 192,
        }
    }

    /// Calibrated match threshold. The geometric vector carries far less
    /// signal, so it needs a much stricter cut-off.
    pub const fn default_threshold(self) -> f32 {
        match self {
            EmbeddingScheme::Geometric => 0.90,
            EmbeddingScheme::Learned => 0.65,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingScheme::Geometric => "geometric",
            EmbeddingScheme::Learned => "learned",
        }
    }
}

impl std::str::FromStr for EmbeddingScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geometric" => Ok(Self::Geometric),
            "learned" => Ok(Self::Learned),
            other => Err(format!("unknown embedding scheme: {other}")),
        }
    }
}

/// Unit-length face embedding. Deserialized values are checked again, so a
/// stored vector that lost its unit length is rejected on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredEmbedding")]
pub struct Embedding {
    values: Vec<f32>,
    scheme: EmbeddingScheme,
}

/// Allowed drift from unit length after a storage round trip.
const UNIT_TOLERANCE: f32 = 1e-3;

#[derive(Deserialize)]
struct StoredEmbedding {
    values: Vec<f32>,
    scheme: EmbeddingScheme,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidEmbedding {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding has non-finite components")]
    NonFinite,
    #[error("embedding norm {0} is not unit length")]
    NotUnitLength(f32),
}

impl TryFrom<StoredEmbedding> for Embedding {
    type Error = InvalidEmbedding;

    fn try_from(stored: StoredEmbedding) -> Result<Self, Self::Error> {
        if stored.values.is_empty() {
            return Err(InvalidEmbedding::Empty);
        }
        if stored.values.iter().any(|v| !v.is_finite()) {
            return Err(InvalidEmbedding::NonFinite);
        }
        let norm = geometry::l2_norm(&stored.values);
        if (norm - 1.0).abs() > UNIT_TOLERANCE {
            return Err(InvalidEmbedding::NotUnitLength(norm));
        }
        Ok(Self {
            values: stored.values,
            scheme: stored.scheme,
        })
    }
}

impl Embedding {
    /// L2-normalize `raw` into an embedding. A zero-norm or empty vector is
    /// an extraction failure.
    pub fn normalized(raw: Vec<f32>, scheme: EmbeddingScheme) -> Result<Self, ExtractionError> {
        if raw.is_empty() || geometry::l2_norm(&raw) <= f32::EPSILON {
            return Err(ExtractionError::DegenerateVector);
        }
        Ok(Self {
            values: geometry::l2_normalize(&raw),
            scheme,
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn scheme(&self) -> EmbeddingScheme {
        self.scheme
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `other` lives in the same embedding space.
    pub fn is_compatible(&self, other: &Embedding) -> bool {
        self.scheme == other.scheme && self.values.len() == other.values.len() && !self.values.is_empty()
    }

    /// Cosine similarity clamped to [0, 1].
    ///
    /// Always processes every dimension. Callers must check
    /// [`is_compatible`](Self::is_compatible) first.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let cos = if denom > 0.0 { dot / denom } else { 0.0 };
        cos.clamp(0.0, 1.0)
    }

    /// Component-wise mean of `embeddings`, re-normalized.
    pub fn average(embeddings: &[Embedding]) -> Result<Embedding, ExtractionError> {
        let first = embeddings.first().ok_or(ExtractionError::DegenerateVector)?;
        if embeddings.iter().any(|e| !first.is_compatible(e)) {
            return Err(ExtractionError::DegenerateVector);
        }
        let rows: Vec<&[f32]> = embeddings.iter().map(|e| e.values()).collect();
        Embedding::normalized(geometry::mean(&rows), first.scheme)
    }
}

/// Stored embeddings for one enrolled user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTemplate {
    pub user: String,
    pub embeddings: Vec<Embedding>,
    pub created_at: DateTime<Utc>,
}

impl FaceTemplate {
    pub fn new(user: impl Into<String>, embeddings: Vec<Embedding>) -> Self {
        Self {
            user: user.into(),
            embeddings,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::normalized(values.to_vec(), EmbeddingScheme::Geometric).unwrap()
    }

    #[test]
    fn test_normalized_has_unit_length() {
        let e = emb(&[3.0, 4.0, 12.0]);
        let norm: f32 = e.values().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_rejects_zero_and_empty() {
        assert!(matches!(
            Embedding::normalized(vec![0.0; 4], EmbeddingScheme::Geometric),
            Err(ExtractionError::DegenerateVector)
        ));
        assert!(Embedding::normalized(vec![], EmbeddingScheme::Learned).is_err());
    }

    #[test]
    fn test_similarity_reflexive_and_symmetric() {
        let a = emb(&[0.2, 0.9, 0.4]);
        let b = emb(&[0.7, 0.1, 0.3]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_similarity_clamps_negative() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_average_of_identical_is_identity() {
        let v = emb(&[0.3, 0.5, 0.8]);
        let avg = Embedding::average(&[v.clone(), v.clone(), v.clone()]).unwrap();
        for (a, b) in avg.values().iter().zip(v.values()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_average_rejects_mixed_dimensions() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert!(Embedding::average(&[a, b]).is_err());
        assert!(Embedding::average(&[]).is_err());
    }

    #[test]
    fn test_compatibility_checks_scheme() {
        let a = emb(&[1.0, 0.0]);
        let b = Embedding::normalized(vec![1.0, 0.0], EmbeddingScheme::Learned).unwrap();
        assert!(!a.is_compatible(&b));
    }

    #[test]
    fn test_core_landmarks_reports_missing() {
        let set = LandmarkSet {
            left_eye: Some(Point::new(0.0, 0.0)),
            right_eye: Some(Point::new(10.0, 0.0)),
            ..Default::default()
        };
        assert!(matches!(
            set.core(),
            Err(ExtractionError::MissingLandmark(Landmark::NoseBase))
        ));
    }

    #[test]
    fn test_eye_state_helpers() {
        let set = LandmarkSet {
            left_eye_open: Some(0.1),
            right_eye_open: Some(0.7),
            ..Default::default()
        };
        assert!(!set.eyes_closed(0.5));
        assert!(set.either_eye_open(0.6));
        assert!(!LandmarkSet::default().eyes_closed(0.5));
    }

    #[test]
    fn test_deserialize_revalidates_unit_length() {
        let stored = serde_json::to_string(&emb(&[3.0, 4.0])).unwrap();
        let back: Embedding = serde_json::from_str(&stored).unwrap();
        assert_eq!(back, emb(&[3.0, 4.0]));

        let scaled = r#"{"values":[3.0,4.0],"scheme":"geometric"}"#;
        let err = serde_json::from_str::<Embedding>(scaled).unwrap_err();
        assert!(err.to_string().contains("not unit length"), "{err}");
        assert!(serde_json::from_str::<Embedding>(r#"{"values":[],"scheme":"learned"}"#).is_err());
        assert!(serde_json::from_str::<Embedding>(r#"{"values":[1.0,null],"scheme":"learned"}"#).is_err());
    }

    #[test]
    fn test_frame_deserializes_without_optional_fields() {
        let json = r#"{"width":640,"height":480,"faces":[{"bounds":{"x":1,"y":2,"width":100,"height":120}}]}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.faces.len(), 1);
        assert!(frame.faces[0].landmarks.left_eye.is_none());
        assert!(frame.image.is_none());
    }
}
