//! Learned face embeddings via an external CNN.
//!
//! The face is cropped from the frame with a small margin, resized to the
//! model's square input, normalized to [-1, 1] and handed to an
//! [`InferenceBackend`]. [`OnnxBackend`] runs a 192-dimensional
//! MobileFaceNet-style model through ONNX Runtime.

use crate::embedding::{EmbeddingExtractor, ExtractionError};
use crate::types::{BoundingBox, Embedding, EmbeddingScheme, FaceDetection, Frame};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LEARNED_INPUT_SIZE: u32 = 112;
const LEARNED_MEAN: f32 = 127.5;
const LEARNED_STD: f32 = 127.5;
/// Margin added around the detector box on every side, as a fraction of its size.
const CROP_PADDING: f32 = 0.10;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pluggable inference runtime: NCHW float tensor in, raw embedding out.
pub trait InferenceBackend {
    /// Square input resolution expected by the model.
    fn input_size(&self) -> u32;

    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;
}

/// ONNX Runtime backend.
pub struct OnnxBackend {
    session: Session,
}

impl OnnxBackend {
    pub fn load(model_path: &str) -> Result<Self, InferenceError> {
        if !Path::new(model_path).exists() {
            return Err(InferenceError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face embedding model"
        );

        Ok(Self { session })
    }
}

impl InferenceBackend for OnnxBackend {
    fn input_size(&self) -> u32 {
        LEARNED_INPUT_SIZE
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Embedding extractor backed by a CNN.
pub struct LearnedExtractor<B> {
    backend: B,
}

impl<B: InferenceBackend> LearnedExtractor<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

impl<B: InferenceBackend> EmbeddingExtractor for LearnedExtractor<B> {
    fn scheme(&self) -> EmbeddingScheme {
        EmbeddingScheme::Learned
    }

    fn extract(&mut self, frame: &Frame, face: &FaceDetection) -> Result<Embedding, ExtractionError> {
        let image = frame.image.as_ref().ok_or(ExtractionError::NoImage)?;
        let crop = crop_face(image, &face.bounds)?;

        let size = self.backend.input_size();
        let resized = imageops::resize(&crop, size, size, FilterType::Triangle);
        let input = preprocess(&resized);

        let raw = self.backend.infer(&input)?;
        let expected = EmbeddingScheme::Learned.dimensions();
        if raw.len() != expected {
            return Err(ExtractionError::UnexpectedDimensions {
                expected,
                actual: raw.len(),
            });
        }

        Embedding::normalized(raw, EmbeddingScheme::Learned)
    }
}

/// Crop the padded face box, clamped to the image bounds.
fn crop_face(image: &RgbImage, bounds: &BoundingBox) -> Result<RgbImage, ExtractionError> {
    let (img_w, img_h) = (image.width() as f32, image.height() as f32);
    let pad_x = bounds.width * CROP_PADDING;
    let pad_y = bounds.height * CROP_PADDING;

    let x0 = (bounds.x - pad_x).clamp(0.0, img_w).floor();
    let y0 = (bounds.y - pad_y).clamp(0.0, img_h).floor();
    let x1 = (bounds.x + bounds.width + pad_x).clamp(0.0, img_w).ceil();
    let y1 = (bounds.y + bounds.height + pad_y).clamp(0.0, img_h).ceil();

    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return Err(ExtractionError::EmptyCrop);
    }

    Ok(imageops::crop_imm(image, x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32).to_image())
}

/// RGB image into a NCHW tensor normalized to [-1, 1].
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let (w, h) = (face.width() as usize, face.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - LEARNED_MEAN) / LEARNED_STD;
        }
    }

    tensor
}
