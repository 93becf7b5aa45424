//! Multi-pose registration capture.
//!
//! The user is walked through a fixed sequence of head poses. Each pose must
//! be held for a countdown before an embedding is taken from the current
//! frame; losing the pose cancels the countdown. When every pose is captured
//! the per-pose embeddings are averaged into the template's single embedding.
//! Nothing is kept if the session is cancelled.

use crate::embedding::ExtractionError;
use crate::quality::{FrameIssue, QualityGate};
use crate::types::{Embedding, FaceDetection, FaceTemplate, Frame};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pose {
    Center,
    Left,
    Right,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseSequence {
    /// center, left, right, up, down
    #[default]
    Full,
    /// center, left, right
    Compact,
}

impl PoseSequence {
    pub fn poses(self) -> &'static [Pose] {
        match self {
            PoseSequence::Full => &[Pose::Center, Pose::Left, Pose::Right, Pose::Up, Pose::Down],
            PoseSequence::Compact => &[Pose::Center, Pose::Left, Pose::Right],
        }
    }
}

/// Angle windows and the detector's sign conventions.
#[derive(Debug, Clone, Copy)]
pub struct PoseWindows {
    /// Max |yaw| and |pitch| for the center pose, degrees.
    pub center_tolerance: f32,
    /// Min angle magnitude in the required direction for turned poses, degrees.
    pub turn_min: f32,
    /// +1.0 if a positive yaw means the user turned left, -1.0 otherwise.
    pub yaw_left_sign: f32,
    /// +1.0 if a positive pitch means the user looked up, -1.0 otherwise.
    pub pitch_up_sign: f32,
}

impl Default for PoseWindows {
    fn default() -> Self {
        Self {
            center_tolerance: 10.0,
            turn_min: 12.0,
            yaw_left_sign: 1.0,
            pitch_up_sign: 1.0,
        }
    }
}

/// Instruction shown while the user is not in the required pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseHint {
    Face(FrameIssue),
    /// Detector reported no head angles.
    NoPoseData,
    LookStraight,
    TurnLeft,
    TurnRight,
    LookUp,
    LookDown,
}

impl PoseWindows {
    /// `None` when the angles satisfy `pose`.
    pub fn check(&self, pose: Pose, yaw: Option<f32>, pitch: Option<f32>) -> Option<PoseHint> {
        let (Some(yaw), Some(pitch)) = (yaw, pitch) else {
            return Some(PoseHint::NoPoseData);
        };
        let left = yaw * self.yaw_left_sign;
        let up = pitch * self.pitch_up_sign;

        let (ok, hint) = match pose {
            Pose::Center => (
                yaw.abs() <= self.center_tolerance && pitch.abs() <= self.center_tolerance,
                PoseHint::LookStraight,
            ),
            Pose::Left => (left > self.turn_min, PoseHint::TurnLeft),
            Pose::Right => (-left > self.turn_min, PoseHint::TurnRight),
            Pose::Up => (up > self.turn_min, PoseHint::LookUp),
            Pose::Down => (-up > self.turn_min, PoseHint::LookDown),
        };
        (!ok).then_some(hint)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sequence: PoseSequence,
    pub hold: Duration,
    pub windows: PoseWindows,
    pub gate: QualityGate,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sequence: PoseSequence::Full,
            hold: Duration::from_millis(1500),
            windows: PoseWindows::default(),
            gate: QualityGate::capture(80.0),
        }
    }
}

/// What a frame or timer tick did to the capture session.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStep {
    /// Not in position; any running countdown was cancelled.
    Hint { pose: Pose, hint: PoseHint, countdown_cancelled: bool },
    HoldStarted { pose: Pose, hold: Duration },
    Holding { pose: Pose, remaining: Duration },
    /// Countdown done: extract from this frame's face and call
    /// [`CaptureSession::record_capture`].
    Capture { pose: Pose },
    /// An extraction is pending or the session is no longer capturing.
    Ignored,
}

/// Outcome of feeding an extraction result back.
#[derive(Debug)]
pub enum CaptureProgress {
    /// Extraction failed; the same pose is retried on the next in-position frame.
    Retry { pose: Pose, error: ExtractionError },
    Advanced { captured: Pose, next: Pose },
    /// Every pose captured. Persist the template, or call
    /// [`CaptureSession::restart`] if saving fails.
    Completed(FaceTemplate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Capturing,
    Extracting,
    Completed,
    Cancelled,
}

/// Registration state for one screen lifetime. Never persisted.
#[derive(Debug)]
pub struct CaptureSession {
    user: String,
    config: CaptureConfig,
    index: usize,
    captured: Vec<Embedding>,
    hold_started: Option<Instant>,
    phase: Phase,
}

impl CaptureSession {
    pub fn new(user: impl Into<String>, config: CaptureConfig) -> Self {
        Self {
            user: user.into(),
            config,
            index: 0,
            captured: Vec::new(),
            hold_started: None,
            phase: Phase::Capturing,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Pose currently required, `None` once finished or cancelled.
    pub fn current_pose(&self) -> Option<Pose> {
        match self.phase {
            Phase::Capturing | Phase::Extracting => self.config.sequence.poses().get(self.index).copied(),
            Phase::Completed | Phase::Cancelled => None,
        }
    }

    pub fn captured_count(&self) -> usize {
        self.captured.len()
    }

    pub fn is_holding(&self) -> bool {
        self.hold_started.is_some()
    }

    /// Feed one frame. On [`CaptureStep::Capture`] the returned face is the
    /// one to extract from.
    pub fn on_frame<'a>(&mut self, frame: &'a Frame, now: Instant) -> (CaptureStep, Option<&'a FaceDetection>) {
        if self.phase != Phase::Capturing {
            return (CaptureStep::Ignored, None);
        }
        let Some(pose) = self.current_pose() else {
            return (CaptureStep::Ignored, None);
        };

        let face = match self.config.gate.assess(frame) {
            Ok(face) => face,
            Err(issue) => return (self.lose_position(pose, PoseHint::Face(issue)), None),
        };

        let lm = &face.landmarks;
        if let Some(hint) = self.config.windows.check(pose, lm.yaw, lm.pitch) {
            return (self.lose_position(pose, hint), None);
        }

        let Some(started) = self.hold_started else {
            self.hold_started = Some(now);
            if self.config.hold.is_zero() {
                return self.begin_capture(pose, face);
            }
            return (CaptureStep::HoldStarted { pose, hold: self.config.hold }, None);
        };

        let elapsed = now.saturating_duration_since(started);
        if elapsed >= self.config.hold {
            self.begin_capture(pose, face)
        } else {
            (CaptureStep::Holding { pose, remaining: self.config.hold - elapsed }, None)
        }
    }

    /// Countdown tick from the screen timer; reports the remaining hold time.
    pub fn on_tick(&self, now: Instant) -> Option<CaptureStep> {
        let started = self.hold_started?;
        let pose = self.current_pose()?;
        if self.phase != Phase::Capturing {
            return None;
        }
        let remaining = self.config.hold.saturating_sub(now.saturating_duration_since(started));
        Some(CaptureStep::Holding { pose, remaining })
    }

    /// Feed back the extraction result for the face returned with
    /// [`CaptureStep::Capture`].
    pub fn record_capture(&mut self, result: Result<Embedding, ExtractionError>) -> Option<CaptureProgress> {
        if self.phase != Phase::Extracting {
            return None;
        }
        let pose = self.current_pose()?;
        self.phase = Phase::Capturing;

        // The countdown stays complete, so the next in-position frame
        // captures again straight away.
        let embedding = match result {
            Ok(e) => e,
            Err(error) => {
                tracing::debug!(?pose, %error, "pose extraction failed; retrying");
                return Some(CaptureProgress::Retry { pose, error });
            }
        };
        self.hold_started = None;

        self.captured.push(embedding);
        self.index += 1;
        tracing::info!(user = %self.user, ?pose, captured = self.captured.len(), "pose captured");

        if let Some(&next) = self.config.sequence.poses().get(self.index) {
            return Some(CaptureProgress::Advanced { captured: pose, next });
        }

        match Embedding::average(&self.captured) {
            Ok(mean) => {
                self.phase = Phase::Completed;
                Some(CaptureProgress::Completed(FaceTemplate::new(self.user.clone(), vec![mean])))
            }
            Err(error) => {
                tracing::warn!(user = %self.user, %error, "pose embeddings could not be averaged; restarting");
                self.restart();
                Some(CaptureProgress::Retry { pose: Pose::Center, error })
            }
        }
    }

    /// Discard everything and start again from the first pose.
    pub fn restart(&mut self) {
        self.index = 0;
        self.captured.clear();
        self.hold_started = None;
        self.phase = Phase::Capturing;
    }

    /// User backed out: drop all accumulated embeddings.
    pub fn cancel(&mut self) {
        self.captured.clear();
        self.hold_started = None;
        self.phase = Phase::Cancelled;
    }

    fn begin_capture<'a>(&mut self, pose: Pose, face: &'a FaceDetection) -> (CaptureStep, Option<&'a FaceDetection>) {
        self.phase = Phase::Extracting;
        (CaptureStep::Capture { pose }, Some(face))
    }

    fn lose_position(&mut self, pose: Pose, hint: PoseHint) -> CaptureStep {
        let countdown_cancelled = self.hold_started.take().is_some();
        if countdown_cancelled {
            tracing::debug!(?pose, ?hint, "pose lost; countdown cancelled");
        }
        CaptureStep::Hint { pose, hint, countdown_cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::tests::face_at;
    use crate::embedding::{EmbeddingExtractor, GeometricExtractor};
    use crate::types::EmbeddingScheme;

    fn posed(yaw: f32, pitch: f32) -> Frame {
        let mut face = face_at(1.0, 0.0);
        face.landmarks.yaw = Some(yaw);
        face.landmarks.pitch = Some(pitch);
        Frame { width: 640, height: 480, faces: vec![face], image: None }
    }

    fn compact() -> CaptureConfig {
        CaptureConfig {
            sequence: PoseSequence::Compact,
            hold: Duration::from_millis(1000),
            ..Default::default()
        }
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::normalized(values.to_vec(), EmbeddingScheme::Geometric).unwrap()
    }

    /// Hold `frame` long enough to trigger a capture and return the face.
    fn hold(session: &mut CaptureSession, frame: &Frame, t0: Instant) {
        let (step, _) = session.on_frame(frame, t0);
        assert!(matches!(step, CaptureStep::HoldStarted { .. }), "got {step:?}");
        let (step, face) = session.on_frame(frame, t0 + Duration::from_millis(1000));
        assert!(matches!(step, CaptureStep::Capture { .. }), "got {step:?}");
        assert!(face.is_some());
    }

    #[test]
    fn test_pose_windows() {
        let w = PoseWindows::default();
        assert_eq!(w.check(Pose::Center, Some(10.0), Some(-10.0)), None);
        assert_eq!(w.check(Pose::Center, Some(10.5), Some(0.0)), Some(PoseHint::LookStraight));
        assert_eq!(w.check(Pose::Left, Some(12.5), Some(0.0)), None);
        assert_eq!(w.check(Pose::Left, Some(12.0), Some(0.0)), Some(PoseHint::TurnLeft));
        assert_eq!(w.check(Pose::Left, Some(-30.0), Some(0.0)), Some(PoseHint::TurnLeft));
        assert_eq!(w.check(Pose::Right, Some(-13.0), Some(0.0)), None);
        assert_eq!(w.check(Pose::Up, Some(0.0), Some(15.0)), None);
        assert_eq!(w.check(Pose::Down, Some(0.0), Some(15.0)), Some(PoseHint::LookDown));
        assert_eq!(w.check(Pose::Down, Some(0.0), Some(-15.0)), None);
        assert_eq!(w.check(Pose::Center, None, Some(0.0)), Some(PoseHint::NoPoseData));
    }

    #[test]
    fn test_sign_convention_flips_left_right() {
        let w = PoseWindows { yaw_left_sign: -1.0, ..Default::default() };
        assert_eq!(w.check(Pose::Left, Some(-20.0), Some(0.0)), None);
        assert_eq!(w.check(Pose::Right, Some(20.0), Some(0.0)), None);
    }

    #[test]
    fn test_losing_position_cancels_countdown() {
        let mut s = CaptureSession::new("alice", compact());
        let t0 = Instant::now();
        s.on_frame(&posed(0.0, 0.0), t0);
        assert!(s.is_holding());

        let (step, _) = s.on_frame(&posed(25.0, 0.0), t0 + Duration::from_millis(900));
        assert_eq!(
            step,
            CaptureStep::Hint { pose: Pose::Center, hint: PoseHint::LookStraight, countdown_cancelled: true }
        );
        assert!(!s.is_holding());

        // No partial credit: the countdown starts over.
        let (step, _) = s.on_frame(&posed(0.0, 0.0), t0 + Duration::from_millis(1000));
        assert!(matches!(step, CaptureStep::HoldStarted { .. }));
    }

    #[test]
    fn test_holding_reports_remaining() {
        let mut s = CaptureSession::new("alice", compact());
        let t0 = Instant::now();
        let held = posed(0.0, 0.0);
        s.on_frame(&held, t0);
        let (step, face) = s.on_frame(&held, t0 + Duration::from_millis(400));
        assert_eq!(step, CaptureStep::Holding { pose: Pose::Center, remaining: Duration::from_millis(600) });
        assert!(face.is_none());
        assert_eq!(
            s.on_tick(t0 + Duration::from_millis(700)),
            Some(CaptureStep::Holding { pose: Pose::Center, remaining: Duration::from_millis(300) })
        );
    }

    #[test]
    fn test_face_issue_is_a_hint() {
        let mut s = CaptureSession::new("alice", compact());
        let empty = Frame { width: 640, height: 480, faces: vec![], image: None };
        let (step, _) = s.on_frame(&empty, Instant::now());
        assert!(matches!(step, CaptureStep::Hint { hint: PoseHint::Face(FrameIssue::NoFaceDetected), .. }));
    }

    #[test]
    fn test_extraction_failure_keeps_pose() {
        let mut s = CaptureSession::new("alice", compact());
        let t0 = Instant::now();
        hold(&mut s, &posed(0.0, 0.0), t0);
        let progress = s.record_capture(Err(ExtractionError::DegenerateVector)).unwrap();
        assert!(matches!(progress, CaptureProgress::Retry { pose: Pose::Center, .. }));
        assert_eq!(s.current_pose(), Some(Pose::Center));
        assert_eq!(s.captured_count(), 0);

        // Retried on the next in-position frame without a new countdown.
        let centred = posed(0.0, 0.0);
        let (step, face) = s.on_frame(&centred, t0 + Duration::from_millis(1100));
        assert_eq!(step, CaptureStep::Capture { pose: Pose::Center });
        assert!(face.is_some());
        s.record_capture(Ok(emb(&[1.0, 0.0]))).unwrap();
        assert_eq!(s.captured_count(), 1);
        assert!(!s.is_holding());
    }

    #[test]
    fn test_losing_position_after_extraction_failure_restarts_countdown() {
        let mut s = CaptureSession::new("alice", compact());
        let t0 = Instant::now();
        hold(&mut s, &posed(0.0, 0.0), t0);
        s.record_capture(Err(ExtractionError::DegenerateVector)).unwrap();

        let (step, _) = s.on_frame(&posed(25.0, 0.0), t0 + Duration::from_millis(1100));
        assert!(matches!(step, CaptureStep::Hint { countdown_cancelled: true, .. }));
        let (step, _) = s.on_frame(&posed(0.0, 0.0), t0 + Duration::from_millis(1200));
        assert!(matches!(step, CaptureStep::HoldStarted { pose: Pose::Center, .. }));
    }

    #[test]
    fn test_frames_ignored_while_extracting() {
        let mut s = CaptureSession::new("alice", compact());
        let t0 = Instant::now();
        hold(&mut s, &posed(0.0, 0.0), t0);
        let (step, _) = s.on_frame(&posed(0.0, 0.0), t0 + Duration::from_millis(1100));
        assert_eq!(step, CaptureStep::Ignored);
    }

    #[test]
    fn test_three_pose_registration_averages() {
        let mut s = CaptureSession::new("alice", compact());
        let e1 = emb(&[1.0, 0.0, 0.0]);
        let e2 = emb(&[0.0, 1.0, 0.0]);
        let e3 = emb(&[0.0, 0.0, 1.0]);
        let t0 = Instant::now();

        hold(&mut s, &posed(0.0, 0.0), t0);
        assert!(matches!(
            s.record_capture(Ok(e1.clone())),
            Some(CaptureProgress::Advanced { captured: Pose::Center, next: Pose::Left })
        ));

        let t1 = t0 + Duration::from_secs(5);
        hold(&mut s, &posed(20.0, 0.0), t1);
        assert!(matches!(
            s.record_capture(Ok(e2.clone())),
            Some(CaptureProgress::Advanced { captured: Pose::Left, next: Pose::Right })
        ));

        let t2 = t1 + Duration::from_secs(5);
        hold(&mut s, &posed(-20.0, 0.0), t2);
        let Some(CaptureProgress::Completed(template)) = s.record_capture(Ok(e3.clone())) else {
            panic!("expected completion");
        };

        assert_eq!(template.user, "alice");
        assert_eq!(template.embeddings.len(), 1);
        let expected = 1.0 / 3.0f32.sqrt();
        for v in template.embeddings[0].values() {
            assert!((v - expected).abs() < 1e-6);
        }
        assert_eq!(s.current_pose(), None);
    }

    #[test]
    fn test_full_sequence_with_geometric_extractor() {
        let config = CaptureConfig { hold: Duration::ZERO, ..Default::default() };
        let mut s = CaptureSession::new("bob", config);
        let mut extractor = GeometricExtractor::default();
        let t0 = Instant::now();
        let frames = [posed(0.0, 0.0), posed(20.0, 0.0), posed(-20.0, 0.0), posed(0.0, 20.0), posed(0.0, -20.0)];

        let mut template = None;
        for (i, frame) in frames.iter().enumerate() {
            let (step, face) = s.on_frame(frame, t0 + Duration::from_secs(i as u64));
            assert!(matches!(step, CaptureStep::Capture { .. }), "pose {i}: {step:?}");
            let result = extractor.extract(frame, face.unwrap());
            if let Some(CaptureProgress::Completed(t)) = s.record_capture(result) {
                template = Some(t);
            }
        }

        let template = template.expect("template after five poses");
        assert_eq!(template.embeddings[0].len(), 13);
    }

    #[test]
    fn test_cancel_discards_embeddings() {
        let mut s = CaptureSession::new("alice", compact());
        let t0 = Instant::now();
        hold(&mut s, &posed(0.0, 0.0), t0);
        s.record_capture(Ok(emb(&[1.0, 0.0]))).unwrap();
        s.cancel();
        assert_eq!(s.captured_count(), 0);
        assert_eq!(s.current_pose(), None);
        let (step, _) = s.on_frame(&posed(0.0, 0.0), t0 + Duration::from_secs(9));
        assert_eq!(step, CaptureStep::Ignored);
    }

    #[test]
    fn test_restart_after_save_failure_begins_at_first_pose() {
        let mut s = CaptureSession::new("alice", CaptureConfig { hold: Duration::ZERO, ..compact() });
        let t0 = Instant::now();
        for (i, yaw) in [0.0, 20.0, -20.0].into_iter().enumerate() {
            let (step, _) = s.on_frame(&posed(yaw, 0.0), t0 + Duration::from_secs(i as u64));
            assert!(matches!(step, CaptureStep::Capture { .. }));
            s.record_capture(Ok(emb(&[1.0, i as f32])));
        }
        assert_eq!(s.current_pose(), None);

        s.restart();
        assert_eq!(s.current_pose(), Some(Pose::Center));
        assert_eq!(s.captured_count(), 0);
    }
}
