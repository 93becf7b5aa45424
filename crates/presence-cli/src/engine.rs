//! Screen runtime: drives the registration and attendance state machines
//! from a frame stream, a screen timer and the external stores.
//!
//! The state machines never block. Store and position calls run on the
//! blocking pool under a timeout, and a frame is only processed when the
//! [`FrameGate`] admits it.

use crate::config::Config;
use presence_core::attendance::{AttendanceWrite, Epoch, ScanEffect, ScanFailure, ScanKind, ScanOutcome, ScanPrompt, ScanSession};
use presence_core::capture::{CaptureProgress, CaptureSession, CaptureStep};
use presence_core::gate::FrameGate;
use presence_core::store::{
    AttendanceStore, PositionProvider, ScanLogEntry, ScanLogStore, ScanType, StoreError, TemplateStore,
};
use presence_core::{EmbeddingExtractor, EmbeddingScheme, FaceTemplate, Frame, PositionError, PositionReading};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to open frame source {path}: {source}")]
    FrameSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
enum CallError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Run `f` on the blocking pool, giving up after `limit`.
///
/// A timed-out task is not aborted: it keeps running and a write may still
/// commit after the caller saw the timeout. Callers that write must
/// reconcile against the store before reporting failure.
async fn off_loop<T, F>(limit: Duration, f: F) -> Result<T, CallError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Task(e.to_string())),
        Err(_) => Err(CallError::TimedOut(limit)),
    }
}

async fn store_call<T, F>(limit: Duration, f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    off_loop(limit, f)
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())))
}

async fn position_call(
    limit: Duration,
    provider: Arc<dyn PositionProvider>,
) -> Result<PositionReading, PositionError> {
    match off_loop(limit, move || provider.current()).await {
        Ok(fix) => fix,
        Err(CallError::TimedOut(_)) => Err(PositionError::TimedOut),
        Err(e) => Err(PositionError::Unavailable(e.to_string())),
    }
}

/// External collaborators shared by every screen.
#[derive(Clone)]
pub struct Stores {
    pub templates: Arc<dyn TemplateStore>,
    pub attendance: Arc<dyn AttendanceStore>,
    pub scan_log: Arc<dyn ScanLogStore>,
    pub position: Arc<dyn PositionProvider>,
}

/// Live frame stream. Dropping it stops the producer.
pub struct FrameSubscription {
    rx: mpsc::Receiver<Frame>,
    producer: Option<JoinHandle<()>>,
}

impl FrameSubscription {
    /// A finite stream of already-decoded frames.
    #[cfg(test)]
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            if tx.try_send(frame).is_err() {
                break;
            }
        }
        Self { rx, producer: None }
    }

    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// One line of a replay file: detector output plus an optional image path
/// for the learned embedding scheme.
#[derive(Debug, Deserialize)]
struct ReplayFrame {
    #[serde(flatten)]
    frame: Frame,
    #[serde(default)]
    image_path: Option<PathBuf>,
}

/// Replay JSONL detector output as a live stream, one frame per `interval`.
/// Frames that find the channel full are dropped, as a camera would.
pub async fn replay_frames(path: &Path, interval: Duration, capacity: usize) -> Result<FrameSubscription, EngineError> {
    let file = tokio::fs::File::open(path).await.map_err(|source| EngineError::FrameSource {
        path: path.to_path_buf(),
        source,
    })?;
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let source = path.display().to_string();

    let producer = tokio::spawn(async move {
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;
        let mut dropped = 0usize;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "frame replay read failed");
                    break;
                }
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let frame = match decode_frame(&line).await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(line = line_no, error = %e, "skipping malformed frame");
                    continue;
                }
            };
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => break,
            }
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        tracing::debug!(frames = line_no, dropped, "frame replay finished");
    });

    Ok(FrameSubscription {
        rx,
        producer: Some(producer),
    })
}

async fn decode_frame(line: &str) -> Result<Frame, serde_json::Error> {
    let ReplayFrame { mut frame, image_path } = serde_json::from_str(line)?;
    if let Some(path) = image_path {
        let shown = path.display().to_string();
        match tokio::task::spawn_blocking(move || image::open(&path).map(|i| i.to_rgb8())).await {
            Ok(Ok(image)) => frame.image = Some(image),
            Ok(Err(e)) => tracing::warn!(path = %shown, error = %e, "frame image unreadable"),
            Err(e) => tracing::warn!(path = %shown, error = %e, "frame image load failed"),
        }
    }
    Ok(frame)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered {
        user: String,
        scheme: EmbeddingScheme,
        poses: usize,
        log_id: Option<Uuid>,
    },
    /// Stream ended or the user backed out; nothing was kept.
    Cancelled { captured: usize, save_failures: u32 },
}

/// Owns the per-screen machinery: gates, timers and the epoch counter.
pub struct Runtime<'a> {
    config: &'a Config,
    stores: Stores,
    cancel: watch::Receiver<bool>,
    epoch: u64,
}

impl<'a> Runtime<'a> {
    pub fn new(config: &'a Config, stores: Stores, cancel: watch::Receiver<bool>) -> Self {
        Self {
            config,
            stores,
            cancel,
            epoch: 0,
        }
    }

    fn next_epoch(&mut self) -> Epoch {
        self.epoch += 1;
        Epoch(self.epoch)
    }

    fn cancelled(&self, changed: Result<(), watch::error::RecvError>) -> bool {
        changed.is_err() || *self.cancel.borrow()
    }

    /// Run the multi-pose registration screen until a template is saved or
    /// the stream ends.
    pub async fn register(
        &mut self,
        user: &str,
        extractor: &mut dyn EmbeddingExtractor,
        mut frames: FrameSubscription,
    ) -> RegistrationOutcome {
        let capture = self.config.capture_config();
        let poses = capture.sequence.poses().len();
        let mut session = CaptureSession::new(user, capture);
        let gate = FrameGate::new(Duration::from_millis(self.config.registration_throttle_ms));
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut save_failures = 0u32;

        tracing::info!(user, poses, scheme = extractor.scheme().as_str(), "registration started");

        loop {
            tokio::select! {
                changed = self.cancel.changed() => {
                    if self.cancelled(changed) {
                        let captured = session.captured_count();
                        session.cancel();
                        tracing::info!(user, "registration cancelled");
                        return RegistrationOutcome::Cancelled { captured, save_failures };
                    }
                }
                _ = ticker.tick() => {
                    if let Some(step) = session.on_tick(Instant::now()) {
                        report_capture_step(&step);
                    }
                }
                next = frames.next() => {
                    let Some(frame) = next else {
                        let captured = session.captured_count();
                        session.cancel();
                        tracing::info!(user, captured, "frame stream ended before registration completed");
                        return RegistrationOutcome::Cancelled { captured, save_failures };
                    };
                    let Ok(ticket) = gate.admit(Instant::now()) else {
                        continue;
                    };
                    let (step, face) = session.on_frame(&frame, Instant::now());
                    report_capture_step(&step);
                    let Some(face) = face else {
                        continue;
                    };
                    let extracted = extractor.extract(&frame, face);
                    drop(ticket);

                    match session.record_capture(extracted) {
                        None => {}
                        Some(CaptureProgress::Retry { pose, error }) => {
                            tracing::warn!(?pose, %error, "capture failed; hold the pose again");
                        }
                        Some(CaptureProgress::Advanced { captured, next }) => {
                            tracing::info!(?captured, ?next, "pose captured");
                        }
                        Some(CaptureProgress::Completed(template)) => {
                            match self.save_template(template).await {
                                Ok(outcome) => return outcome,
                                Err(e) => {
                                    save_failures += 1;
                                    tracing::warn!(user, error = %e, "template save failed; restarting capture");
                                    session.restart();
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Persist a completed template and log the registration attempt.
    async fn save_template(&self, template: FaceTemplate) -> Result<RegistrationOutcome, StoreError> {
        let user = template.user.clone();
        let scheme = template
            .embeddings
            .first()
            .map(|e| e.scheme())
            .unwrap_or(EmbeddingScheme::Geometric);
        let poses = self.config.pose_sequence.poses().len();

        let store = self.stores.templates.clone();
        let saved = store_call(self.config.store_timeout(), move || store.save(&template)).await;

        let log_id = self
            .append_log(ScanLogEntry {
                user: user.clone(),
                scan_type: ScanType::Registration,
                success: saved.is_ok(),
                similarity: None,
                error: saved.as_ref().err().map(|e| e.to_string()),
                position: None,
                at: chrono::Utc::now(),
            })
            .await;

        saved?;
        tracing::info!(user = %user, scheme = scheme.as_str(), "registration complete");
        Ok(RegistrationOutcome::Registered {
            user,
            scheme,
            poses,
            log_id,
        })
    }

    /// Run one check-in or check-out screen to its final result.
    pub async fn scan(
        &mut self,
        kind: ScanKind,
        user: &str,
        extractor: &mut dyn EmbeddingExtractor,
        mut frames: FrameSubscription,
    ) -> Result<ScanOutcome, ScanFailure> {
        let epoch = self.next_epoch();
        let mut session = ScanSession::new(user, kind, epoch, self.config.scan_config());
        let gate = FrameGate::new(Duration::from_millis(self.config.liveness_throttle_ms));
        let mut pending: VecDeque<ScanEffect> = session.start().into();

        loop {
            while let Some(effect) = pending.pop_front() {
                if let Some(result) = self.execute(&mut session, effect, &mut pending).await {
                    return result;
                }
            }
            if session.is_done() {
                return Err(ScanFailure::Cancelled);
            }

            tokio::select! {
                changed = self.cancel.changed() => {
                    if self.cancelled(changed) {
                        pending.extend(session.cancel());
                    }
                }
                next = frames.next() => match next {
                    None => {
                        tracing::info!(user, "frame stream ended during scan");
                        pending.extend(session.cancel());
                    }
                    Some(frame) => {
                        let Ok(_ticket) = gate.admit(Instant::now()) else {
                            continue;
                        };
                        pending.extend(session.on_frame(&frame, extractor));
                    }
                },
            }
        }
    }

    /// Carry out one effect, feeding completions back into `session`.
    /// Returns the final result when the session finishes.
    async fn execute(
        &self,
        session: &mut ScanSession,
        effect: ScanEffect,
        pending: &mut VecDeque<ScanEffect>,
    ) -> Option<Result<ScanOutcome, ScanFailure>> {
        let epoch = session.epoch();
        let timeout = self.config.store_timeout();

        match effect {
            ScanEffect::LoadOpenSession => {
                let store = self.stores.attendance.clone();
                let user = session.user().to_string();
                let result = store_call(timeout, move || store.open_session(&user)).await;
                pending.extend(session.on_session_loaded(epoch, result));
            }
            ScanEffect::ReadPosition => {
                let fix = position_call(self.config.position_timeout(), self.stores.position.clone()).await;
                pending.extend(session.on_position(epoch, fix));
            }
            ScanEffect::LoadTemplate => {
                let store = self.stores.templates.clone();
                let user = session.user().to_string();
                let result = store_call(timeout, move || store.get(&user)).await;
                pending.extend(session.on_template_loaded(epoch, result));
            }
            ScanEffect::Prompt(prompt) => report_prompt(prompt),
            ScanEffect::AttemptFailed { reason, similarity, remaining } => {
                tracing::info!(?reason, ?similarity, remaining, "face not recognised, try again");
            }
            ScanEffect::Record { log, write } => {
                let log_id = self.append_log(log).await;
                if let Some(write) = write {
                    let user = session.user().to_string();
                    let result = self.write_attendance(&user, write.with_log(log_id)).await;
                    pending.extend(session.on_recorded(epoch, log_id, result));
                }
            }
            ScanEffect::Finished(result) => return Some(result),
        }
        None
    }

    async fn write_attendance(&self, user: &str, write: AttendanceWrite) -> Result<Uuid, StoreError> {
        let store = self.stores.attendance.clone();
        let timeout = self.config.store_timeout();
        let call = match write.clone() {
            AttendanceWrite::CheckIn(check_in) => off_loop(timeout, move || store.create_check_in(&check_in)).await,
            AttendanceWrite::CheckOut(check_out) => {
                let id = check_out.session_id;
                off_loop(timeout, move || store.close_check_out(&check_out).map(|()| id)).await
            }
        };
        match call {
            Ok(result) => result,
            Err(e @ CallError::TimedOut(_)) => self.reconcile_write(user, &write, e).await,
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }

    /// A timed-out write may have landed anyway; read the open session back
    /// so a committed write is never reported as failed.
    async fn reconcile_write(&self, user: &str, write: &AttendanceWrite, error: CallError) -> Result<Uuid, StoreError> {
        let store = self.stores.attendance.clone();
        let owned = user.to_string();
        let open = store_call(self.config.store_timeout(), move || store.open_session(&owned)).await;
        let landed = match (write, open) {
            // Stored timestamps keep microsecond precision.
            (AttendanceWrite::CheckIn(check_in), Ok(Some(record)))
                if record.check_in_at.timestamp_micros() == check_in.at.timestamp_micros() =>
            {
                Some(record.id)
            }
            (AttendanceWrite::CheckOut(check_out), Ok(open)) if open.as_ref().map(|r| r.id) != Some(check_out.session_id) => {
                Some(check_out.session_id)
            }
            _ => None,
        };
        match landed {
            Some(id) => {
                tracing::warn!(user, record = %id, "attendance write timed out but committed");
                Ok(id)
            }
            None => Err(StoreError::Unavailable(error.to_string())),
        }
    }

    /// Best effort: a failed append is logged and never blocks the caller.
    async fn append_log(&self, entry: ScanLogEntry) -> Option<Uuid> {
        let store = self.stores.scan_log.clone();
        match store_call(self.config.store_timeout(), move || store.append(&entry)).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "scan log append failed");
                None
            }
        }
    }
}

fn report_prompt(prompt: ScanPrompt) {
    match prompt {
        ScanPrompt::Face(issue) => tracing::debug!(%issue, "face check"),
        ScanPrompt::Liveness(p) => tracing::info!(prompt = p.message(), "liveness"),
    }
}

fn report_capture_step(step: &CaptureStep) {
    match step {
        CaptureStep::Hint { pose, hint, countdown_cancelled } => {
            tracing::debug!(?pose, ?hint, countdown_cancelled, "pose hint");
        }
        CaptureStep::HoldStarted { pose, hold } => tracing::info!(?pose, hold_ms = hold.as_millis() as u64, "hold still"),
        CaptureStep::Holding { pose, remaining } => {
            tracing::debug!(?pose, remaining_ms = remaining.as_millis() as u64, "holding");
        }
        CaptureStep::Capture { pose } => tracing::debug!(?pose, "capturing"),
        CaptureStep::Ignored => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::capture::PoseSequence;
    use presence_core::store::memory::{MemoryAttendanceStore, MemoryScanLog, MemoryTemplateStore};
    use presence_core::store::FixedPosition;
    use presence_core::types::{BoundingBox, FaceDetection, LandmarkSet, Point};
    use presence_core::{Embedding, ExtractionError, Geofence, GeometricExtractor};

    struct Harness {
        config: Config,
        templates: Arc<MemoryTemplateStore>,
        attendance: Arc<MemoryAttendanceStore>,
        scan_log: Arc<MemoryScanLog>,
        cancel_tx: watch::Sender<bool>,
        cancel_rx: watch::Receiver<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let config = Config {
                office: Geofence { latitude: -6.2, longitude: 106.8, radius_m: 100.0 },
                pose_sequence: PoseSequence::Compact,
                hold_ms: 0,
                liveness_throttle_ms: 0,
                registration_throttle_ms: 0,
                ..Config::default()
            };
            let (cancel_tx, cancel_rx) = watch::channel(false);
            Self {
                config,
                templates: Arc::new(MemoryTemplateStore::default()),
                attendance: Arc::new(MemoryAttendanceStore::default()),
                scan_log: Arc::new(MemoryScanLog::default()),
                cancel_tx,
                cancel_rx,
            }
        }

        fn runtime(&self, mocked: bool) -> Runtime<'_> {
            let fix = Ok(PositionReading { latitude: -6.2, longitude: 106.8, is_mocked: mocked, accuracy_m: Some(5.0) });
            let stores = Stores {
                templates: self.templates.clone(),
                attendance: self.attendance.clone(),
                scan_log: self.scan_log.clone(),
                position: Arc::new(FixedPosition(fix)),
            };
            Runtime::new(&self.config, stores, self.cancel_rx.clone())
        }
    }

    /// Returns the same learned embedding for every face.
    struct Constant(Vec<f32>);

    impl EmbeddingExtractor for Constant {
        fn scheme(&self) -> EmbeddingScheme {
            EmbeddingScheme::Learned
        }

        fn extract(&mut self, _frame: &Frame, _face: &FaceDetection) -> Result<Embedding, ExtractionError> {
            Embedding::normalized(self.0.clone(), EmbeddingScheme::Learned)
        }
    }

    fn frame(yaw: f32, pitch: f32, eyes: f32) -> Frame {
        let landmarks = LandmarkSet {
            left_eye: Some(Point::new(140.0, 150.0)),
            right_eye: Some(Point::new(180.0, 150.0)),
            nose_base: Some(Point::new(160.0, 175.0)),
            left_mouth: Some(Point::new(145.0, 200.0)),
            right_mouth: Some(Point::new(175.0, 200.0)),
            bottom_mouth: Some(Point::new(160.0, 210.0)),
            yaw: Some(yaw),
            pitch: Some(pitch),
            left_eye_open: Some(eyes),
            right_eye_open: Some(eyes),
            smiling: Some(0.05),
        };
        Frame {
            width: 640,
            height: 480,
            faces: vec![FaceDetection {
                bounds: BoundingBox { x: 100.0, y: 100.0, width: 120.0, height: 150.0 },
                landmarks,
            }],
            image: None,
        }
    }

    fn blink_frames() -> Vec<Frame> {
        vec![frame(0.0, 0.0, 0.9), frame(0.0, 0.0, 0.1), frame(0.0, 0.0, 0.9)]
    }

    fn enroll(h: &Harness) {
        let template = FaceTemplate::new(
            "alice",
            vec![Embedding::normalized(vec![1.0, 0.0], EmbeddingScheme::Learned).unwrap()],
        );
        h.templates.save(&template).unwrap();
    }

    #[tokio::test]
    async fn test_check_in_records_session_and_one_log() {
        let h = Harness::new();
        enroll(&h);
        let mut rt = h.runtime(false);
        let mut extractor = Constant(vec![0.70, (1.0f32 - 0.49).sqrt()]);

        let outcome = rt
            .scan(ScanKind::CheckIn, "alice", &mut extractor, FrameSubscription::from_frames(blink_frames()))
            .await
            .unwrap();
        assert!((outcome.similarity - 0.70).abs() < 1e-4);
        assert!(outcome.write_error.is_none());

        let open = h.attendance.open_session("alice").unwrap().unwrap();
        assert_eq!(Some(open.id), outcome.record_id);
        assert_eq!(open.check_in_log, outcome.log_id);

        let logs = h.scan_log.recent("alice", 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].entry.success);
        assert!((logs[0].entry.similarity.unwrap() - 0.70).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_check_in_then_check_out() {
        let h = Harness::new();
        enroll(&h);
        let mut rt = h.runtime(false);
        let mut extractor = Constant(vec![1.0, 0.1]);

        rt.scan(ScanKind::CheckIn, "alice", &mut extractor, FrameSubscription::from_frames(blink_frames()))
            .await
            .unwrap();
        let again = rt
            .scan(ScanKind::CheckIn, "alice", &mut extractor, FrameSubscription::from_frames(blink_frames()))
            .await;
        assert_eq!(again.unwrap_err(), ScanFailure::AlreadyCheckedIn);

        rt.scan(ScanKind::CheckOut, "alice", &mut extractor, FrameSubscription::from_frames(blink_frames()))
            .await
            .unwrap();
        assert!(h.attendance.open_session("alice").unwrap().is_none());
        let history = h.attendance.history("alice", 5).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].check_out_at.is_some());
        assert_eq!(h.scan_log.len(), 2);
    }

    #[tokio::test]
    async fn test_check_out_without_session_writes_nothing() {
        let h = Harness::new();
        enroll(&h);
        let mut rt = h.runtime(false);
        let result = rt
            .scan(ScanKind::CheckOut, "alice", &mut Constant(vec![1.0, 0.0]), FrameSubscription::from_frames(blink_frames()))
            .await;
        assert_eq!(result.unwrap_err(), ScanFailure::NotCheckedIn);
        assert!(h.scan_log.is_empty());
    }

    #[tokio::test]
    async fn test_mock_location_rejected() {
        let h = Harness::new();
        enroll(&h);
        let mut rt = h.runtime(true);
        let result = rt
            .scan(ScanKind::CheckIn, "alice", &mut Constant(vec![1.0, 0.0]), FrameSubscription::from_frames(blink_frames()))
            .await;
        assert_eq!(result.unwrap_err().code(), "mock_location_detected");
        assert!(h.attendance.open_session("alice").unwrap().is_none());
        assert_eq!(h.scan_log.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_end_cancels_scan() {
        let h = Harness::new();
        enroll(&h);
        let mut rt = h.runtime(false);
        let frames = vec![frame(0.0, 0.0, 0.9), frame(0.0, 0.0, 0.9)];
        let result = rt
            .scan(ScanKind::CheckIn, "alice", &mut Constant(vec![1.0, 0.0]), FrameSubscription::from_frames(frames))
            .await;
        assert_eq!(result.unwrap_err(), ScanFailure::Cancelled);
        assert!(h.attendance.open_session("alice").unwrap().is_none());
        assert!(h.scan_log.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_signal_stops_scan() {
        let h = Harness::new();
        enroll(&h);
        let mut rt = h.runtime(false);
        let (_tx, rx) = mpsc::channel::<Frame>(1);
        let idle = FrameSubscription { rx, producer: None };
        h.cancel_tx.send(true).unwrap();
        let result = rt.scan(ScanKind::CheckIn, "alice", &mut Constant(vec![1.0, 0.0]), idle).await;
        assert_eq!(result.unwrap_err(), ScanFailure::Cancelled);
    }

    #[tokio::test]
    async fn test_attendance_write_failure_keeps_verification() {
        let h = Harness::new();
        enroll(&h);
        let mut rt = h.runtime(false);
        let frames = blink_frames();
        // Open-session lookup must succeed, so only the write can fail: flip
        // the store after the first frame has been queued.
        let result = {
            let attendance = h.attendance.clone();
            let mut extractor = FailStoreOnExtract { inner: Constant(vec![1.0, 0.0]), store: attendance };
            rt.scan(ScanKind::CheckIn, "alice", &mut extractor, FrameSubscription::from_frames(frames)).await
        };
        let outcome = result.unwrap();
        assert!(outcome.record_id.is_none());
        assert!(outcome.write_error.is_some());
        assert_eq!(h.scan_log.len(), 1);
    }

    /// Commits writes immediately but acknowledges them after `delay`.
    struct SlowAck {
        inner: Arc<MemoryAttendanceStore>,
        delay: Duration,
    }

    impl AttendanceStore for SlowAck {
        fn open_session(&self, user: &str) -> Result<Option<presence_core::store::AttendanceRecord>, StoreError> {
            self.inner.open_session(user)
        }

        fn create_check_in(&self, check_in: &presence_core::store::CheckIn) -> Result<Uuid, StoreError> {
            let id = self.inner.create_check_in(check_in);
            std::thread::sleep(self.delay);
            id
        }

        fn close_check_out(&self, check_out: &presence_core::store::CheckOut) -> Result<(), StoreError> {
            self.inner.close_check_out(check_out)?;
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn history(&self, user: &str, limit: usize) -> Result<Vec<presence_core::store::AttendanceRecord>, StoreError> {
            self.inner.history(user, limit)
        }
    }

    #[tokio::test]
    async fn test_timed_out_check_in_that_committed_is_reported() {
        let mut h = Harness::new();
        h.config.store_timeout_secs = 1;
        enroll(&h);
        let fix = Ok(PositionReading { latitude: -6.2, longitude: 106.8, is_mocked: false, accuracy_m: Some(5.0) });
        let stores = Stores {
            templates: h.templates.clone(),
            attendance: Arc::new(SlowAck { inner: h.attendance.clone(), delay: Duration::from_millis(1500) }),
            scan_log: h.scan_log.clone(),
            position: Arc::new(FixedPosition(fix)),
        };
        let mut rt = Runtime::new(&h.config, stores, h.cancel_rx.clone());

        let outcome = rt
            .scan(
                ScanKind::CheckIn,
                "alice",
                &mut Constant(vec![1.0, 0.0]),
                FrameSubscription::from_frames(blink_frames()),
            )
            .await
            .unwrap();
        assert!(outcome.write_error.is_none(), "got {:?}", outcome.write_error);
        let open = h.attendance.open_session("alice").unwrap().unwrap();
        assert_eq!(outcome.record_id, Some(open.id));
    }

    struct FailStoreOnExtract {
        inner: Constant,
        store: Arc<MemoryAttendanceStore>,
    }

    impl EmbeddingExtractor for FailStoreOnExtract {
        fn scheme(&self) -> EmbeddingScheme {
            self.inner.scheme()
        }

        fn extract(&mut self, frame: &Frame, face: &FaceDetection) -> Result<Embedding, ExtractionError> {
            self.store.set_failing(true);
            self.inner.extract(frame, face)
        }
    }

    fn pose_frames() -> Vec<Frame> {
        vec![frame(0.0, 0.0, 0.9), frame(25.0, 0.0, 0.9), frame(-25.0, 0.0, 0.9)]
    }

    #[tokio::test]
    async fn test_registration_saves_averaged_template() {
        let h = Harness::new();
        let mut rt = h.runtime(false);
        let outcome = rt
            .register("alice", &mut GeometricExtractor::default(), FrameSubscription::from_frames(pose_frames()))
            .await;
        assert!(matches!(outcome, RegistrationOutcome::Registered { poses: 3, .. }));

        let template = h.templates.get("alice").unwrap().unwrap();
        assert_eq!(template.embeddings.len(), 1);
        assert_eq!(template.embeddings[0].len(), 13);

        let logs = h.scan_log.recent("alice", 5).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].entry.scan_type, ScanType::Registration);
        assert!(logs[0].entry.success);
    }

    #[tokio::test]
    async fn test_registration_save_failure_restarts() {
        let h = Harness::new();
        h.templates.set_failing(true);
        let mut rt = h.runtime(false);
        let outcome = rt
            .register("alice", &mut GeometricExtractor::default(), FrameSubscription::from_frames(pose_frames()))
            .await;
        assert_eq!(outcome, RegistrationOutcome::Cancelled { captured: 0, save_failures: 1 });

        let logs = h.scan_log.recent("alice", 5).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].entry.success);
        assert!(logs[0].entry.error.is_some());
    }

    #[tokio::test]
    async fn test_replay_skips_malformed_lines() {
        let dir = std::env::temp_dir().join(format!("presence-replay-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frames.jsonl");
        let good = serde_json::to_string(&frame(0.0, 0.0, 0.9)).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();

        let mut frames = replay_frames(&path, Duration::ZERO, 8).await.unwrap();
        let mut count = 0;
        while let Some(f) = frames.next().await {
            assert_eq!(f.faces.len(), 1);
            count += 1;
        }
        assert_eq!(count, 2);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_replay_missing_file() {
        let err = replay_frames(Path::new("/nonexistent/frames.jsonl"), Duration::ZERO, 2)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::FrameSource { .. }));
    }
}
