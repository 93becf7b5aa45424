//! Per-frame face-quality gating.
//!
//! Every issue here is transient: it is surfaced as a live hint and clears on
//! the next good frame.

use crate::types::{FaceDetection, Frame};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameIssue {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected")]
    MultipleFacesDetected,
    #[error("face too small, move closer")]
    FaceTooSmall,
    #[error("face the camera directly")]
    OffAngle,
    #[error("keep your eyes open")]
    EyesClosed,
}

/// Quality requirements for the active screen.
#[derive(Debug, Clone)]
pub struct QualityGate {
    /// Minimum face box width in pixels.
    pub min_face_px: f32,
    /// Maximum |yaw| and |pitch| in degrees; `None` leaves pose to the caller.
    pub max_angle: Option<f32>,
    /// Minimum eye-open probability for both eyes; `None` when liveness owns
    /// the eye state.
    pub min_eye_open: Option<f32>,
}

impl QualityGate {
    /// Near-frontal gate used while waiting for a liveness challenge.
    pub fn liveness(min_face_px: f32) -> Self {
        Self {
            min_face_px,
            max_angle: Some(20.0),
            min_eye_open: None,
        }
    }

    /// Gate used during pose capture: the pose machine checks angles itself.
    pub fn capture(min_face_px: f32) -> Self {
        Self {
            min_face_px,
            max_angle: None,
            min_eye_open: Some(0.5),
        }
    }

    /// Return the single face in `frame` if it meets the requirements.
    pub fn assess<'a>(&self, frame: &'a Frame) -> Result<&'a FaceDetection, FrameIssue> {
        let face = match frame.faces.as_slice() {
            [] => return Err(FrameIssue::NoFaceDetected),
            [face] => face,
            _ => return Err(FrameIssue::MultipleFacesDetected),
        };

        if face.bounds.width < self.min_face_px {
            return Err(FrameIssue::FaceTooSmall);
        }

        if let Some(max) = self.max_angle {
            let yaw = face.landmarks.yaw.unwrap_or(0.0).abs();
            let pitch = face.landmarks.pitch.unwrap_or(0.0).abs();
            if yaw > max || pitch > max {
                return Err(FrameIssue::OffAngle);
            }
        }

        if let Some(min_open) = self.min_eye_open {
            let lm = &face.landmarks;
            let closed = |p: Option<f32>| p.is_some_and(|p| p < min_open);
            if closed(lm.left_eye_open) || closed(lm.right_eye_open) {
                return Err(FrameIssue::EyesClosed);
            }
        }

        Ok(face)
    }
}
