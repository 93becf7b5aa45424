//! presence-core: Face-verified attendance engine.
//!
//! Turns detector output into face embeddings, matches them against enrolled
//! templates, and drives the liveness, pose-capture and attendance-session
//! state machines. Camera, detector, inference runtime, storage and GPS are
//! external collaborators reached through the traits in [`store`] and
//! [`learned`].

pub mod attendance;
pub mod capture;
pub mod embedding;
pub mod gate;
pub mod geofence;
pub mod geometry;
pub mod learned;
pub mod liveness;
pub mod matcher;
pub mod quality;
pub mod store;
pub mod types;

pub use attendance::{ScanEffect, ScanFailure, ScanKind, ScanOutcome, ScanSession};
pub use capture::{CaptureSession, CaptureStep, Pose, PoseSequence};
pub use embedding::{EmbeddingExtractor, ExtractionError, GeometricExtractor};
pub use gate::FrameGate;
pub use geofence::{Geofence, GeofenceReason, GeofenceResult, PositionError, PositionReading};
pub use learned::{InferenceBackend, LearnedExtractor, OnnxBackend};
pub use liveness::{LivenessMachine, LivenessPrompt, LivenessState};
pub use matcher::{CosineMatcher, MatchReason, MatchResult, Matcher};
pub use types::{BoundingBox, Embedding, EmbeddingScheme, FaceDetection, FaceTemplate, Frame, LandmarkSet, Point};
