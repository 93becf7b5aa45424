//! Attendance scan session.
//!
//! One [`ScanSession`] lives for one check-in or check-out screen. It checks
//! the per-user session invariant, the geofence, loads the template, runs the
//! liveness challenge and matches the live face, applying a bounded retry
//! budget. It never touches a store itself: every transition returns
//! [`ScanEffect`]s for the owner to execute, and completions are fed back
//! tagged with the session's [`Epoch`] so a late result from an earlier
//! screen cannot corrupt this one.

use crate::embedding::EmbeddingExtractor;
use crate::geofence::{Geofence, GeofenceReason, PositionError, PositionReading};
use crate::liveness::{LivenessEvent, LivenessMachine, LivenessPrompt, LivenessThresholds};
use crate::matcher::{CosineMatcher, MatchReason, Matcher};
use crate::quality::{FrameIssue, QualityGate};
use crate::store::{AttendanceRecord, CheckIn, CheckOut, ScanLogEntry, ScanType, StoreError};
use crate::types::{FaceTemplate, Frame};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Consecutive failed verifications tolerated before the user is told to
/// re-register; the next failure is terminal.
pub const DEFAULT_ALLOWED_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    CheckIn,
    CheckOut,
}

/// Identifies one screen session. Completions carrying another epoch are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch(pub u64);

/// Per-user attendance state as seen by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoActiveSession,
    Active { session_id: Uuid, check_in_at: DateTime<Utc> },
}

impl SessionState {
    pub fn from_open(open: Option<&AttendanceRecord>) -> Self {
        match open {
            Some(r) => SessionState::Active {
                session_id: r.id,
                check_in_at: r.check_in_at,
            },
            None => SessionState::NoActiveSession,
        }
    }

    /// Session invariant: check-in needs no open session, check-out needs one.
    pub fn admit(&self, kind: ScanKind) -> Result<(), ScanFailure> {
        match (kind, self) {
            (ScanKind::CheckIn, SessionState::Active { .. }) => Err(ScanFailure::AlreadyCheckedIn),
            (ScanKind::CheckOut, SessionState::NoActiveSession) => Err(ScanFailure::NotCheckedIn),
            _ => Ok(()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanFailure {
    #[error("already checked in")]
    AlreadyCheckedIn,
    #[error("not checked in")]
    NotCheckedIn,
    #[error("location rejected: {reason:?}")]
    Location { reason: GeofenceReason, distance_m: Option<f64> },
    #[error("no face template enrolled")]
    NotRegistered,
    #[error("stored face template is incompatible; please re-register")]
    IncompatibleTemplate,
    #[error("face not recognised after {attempts} attempts; please re-register")]
    ReRegisterRequired { attempts: u32 },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("scan cancelled")]
    Cancelled,
}

impl ScanFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ScanFailure::AlreadyCheckedIn => "already_checked_in",
            ScanFailure::NotCheckedIn => "not_checked_in",
            ScanFailure::Location { reason, .. } => match reason {
                GeofenceReason::LocationDisabled => "location_disabled",
                GeofenceReason::PermissionDenied => "permission_denied",
                GeofenceReason::PositionUnavailable => "position_unavailable",
                GeofenceReason::InvalidPosition => "invalid_position",
                GeofenceReason::MockLocationDetected => "mock_location_detected",
                GeofenceReason::OutsideRadius => "outside_radius",
                GeofenceReason::Inside => "inside",
            },
            ScanFailure::NotRegistered => "not_registered",
            ScanFailure::IncompatibleTemplate => "incompatible_template",
            ScanFailure::ReRegisterRequired { .. } => "re_register_required",
            ScanFailure::StoreUnavailable(_) => "store_unavailable",
            ScanFailure::Cancelled => "cancelled",
        }
    }

    /// Whether the UI may offer an immediate retry of the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScanFailure::StoreUnavailable(_)
                | ScanFailure::Location { reason: GeofenceReason::PositionUnavailable, .. }
        )
    }
}

/// Why a single verification attempt did not match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptFailure {
    BelowThreshold,
    ExtractionFailed(String),
}

impl AttemptFailure {
    fn code(&self) -> &'static str {
        match self {
            AttemptFailure::BelowThreshold => "below_threshold",
            AttemptFailure::ExtractionFailed(_) => "extraction_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempts still available on this screen.
    Retry { remaining: u32 },
    Exhausted,
}

/// Consecutive-failure budget, scoped to one screen and never persisted.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    allowed: u32,
    consecutive: u32,
}

impl RetryBudget {
    pub fn new(allowed: u32) -> Self {
        Self { allowed, consecutive: 0 }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.consecutive += 1;
        if self.consecutive > self.allowed {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                remaining: self.allowed + 1 - self.consecutive,
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }
}

/// Attendance write that follows a successful verification.
#[derive(Debug, Clone, PartialEq)]
pub enum AttendanceWrite {
    CheckIn(CheckIn),
    CheckOut(CheckOut),
}

impl AttendanceWrite {
    /// Attach the scan log reference once the log append has completed.
    pub fn with_log(mut self, log_id: Option<Uuid>) -> Self {
        match &mut self {
            AttendanceWrite::CheckIn(c) => c.log_id = log_id,
            AttendanceWrite::CheckOut(c) => c.log_id = log_id,
        }
        self
    }
}

/// Live status for the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPrompt {
    Face(FrameIssue),
    Liveness(LivenessPrompt),
}

/// Final result of a verified scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub user: String,
    pub kind: ScanKind,
    pub similarity: f32,
    pub log_id: Option<Uuid>,
    /// The attendance record written or closed.
    pub record_id: Option<Uuid>,
    /// Set when verification succeeded but the attendance write failed.
    pub write_error: Option<StoreError>,
}

/// Work the session owner must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEffect {
    /// Fetch the user's open session; answer with [`ScanSession::on_session_loaded`].
    LoadOpenSession,
    /// Read the position provider; answer with [`ScanSession::on_position`].
    ReadPosition,
    /// Fetch the user's template; answer with [`ScanSession::on_template_loaded`].
    LoadTemplate,
    Prompt(ScanPrompt),
    /// A verification attempt failed but more are allowed.
    AttemptFailed { reason: AttemptFailure, similarity: Option<f32>, remaining: u32 },
    /// Append `log` (best effort, errors swallowed). If `write` is present,
    /// perform it with the log id attached and answer with
    /// [`ScanSession::on_recorded`].
    Record { log: ScanLogEntry, write: Option<AttendanceWrite> },
    Finished(Result<ScanOutcome, ScanFailure>),
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub geofence: Geofence,
    /// Match threshold; defaults to the extractor scheme's calibrated value.
    pub threshold: Option<f32>,
    pub gate: QualityGate,
    pub liveness: LivenessThresholds,
    pub allowed_failures: u32,
}

impl ScanConfig {
    pub fn new(geofence: Geofence) -> Self {
        Self {
            geofence,
            threshold: None,
            gate: QualityGate::liveness(80.0),
            liveness: LivenessThresholds::default(),
            allowed_failures: DEFAULT_ALLOWED_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    LoadingSession,
    Locating,
    LoadingTemplate,
    Scanning,
    Recording,
    Done,
}

/// State for one check-in or check-out screen.
pub struct ScanSession {
    user: String,
    kind: ScanKind,
    epoch: Epoch,
    config: ScanConfig,
    phase: Phase,
    session: SessionState,
    position: Option<PositionReading>,
    template: Option<FaceTemplate>,
    liveness: LivenessMachine,
    retries: RetryBudget,
    pending_similarity: f32,
}

impl ScanSession {
    pub fn new(user: impl Into<String>, kind: ScanKind, epoch: Epoch, config: ScanConfig) -> Self {
        let liveness = LivenessMachine::new(config.liveness);
        let retries = RetryBudget::new(config.allowed_failures);
        Self {
            user: user.into(),
            kind,
            epoch,
            config,
            phase: Phase::Idle,
            session: SessionState::NoActiveSession,
            position: None,
            template: None,
            liveness,
            retries,
            pending_similarity: 0.0,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    pub fn is_scanning(&self) -> bool {
        self.phase == Phase::Scanning
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.retries.consecutive_failures()
    }

    pub fn start(&mut self) -> Vec<ScanEffect> {
        if self.phase != Phase::Idle {
            return Vec::new();
        }
        tracing::info!(user = %self.user, kind = ?self.kind, "scan started");
        self.phase = Phase::LoadingSession;
        vec![ScanEffect::LoadOpenSession]
    }

    pub fn on_session_loaded(
        &mut self,
        epoch: Epoch,
        result: Result<Option<AttendanceRecord>, StoreError>,
    ) -> Vec<ScanEffect> {
        if !self.accepts(epoch, Phase::LoadingSession) {
            return Vec::new();
        }
        let open = match result {
            Ok(open) => open,
            Err(e) => return self.finish(Err(ScanFailure::StoreUnavailable(e.to_string()))),
        };
        self.session = SessionState::from_open(open.as_ref());
        if let Err(failure) = self.session.admit(self.kind) {
            tracing::info!(user = %self.user, reason = failure.code(), "scan rejected by session invariant");
            return self.finish(Err(failure));
        }
        self.phase = Phase::Locating;
        vec![ScanEffect::ReadPosition]
    }

    pub fn on_position(&mut self, epoch: Epoch, fix: Result<PositionReading, PositionError>) -> Vec<ScanEffect> {
        if !self.accepts(epoch, Phase::Locating) {
            return Vec::new();
        }
        let result = self.config.geofence.validate(&fix);
        // NaN has no JSON form; unusable fixes are logged without a position.
        let reading = fix.ok().filter(PositionReading::is_plausible);
        if !result.valid {
            let failure = ScanFailure::Location {
                reason: result.reason,
                distance_m: result.distance_m,
            };
            let log = self.log_entry(false, None, Some(failure.code().to_string()), reading);
            let mut effects = vec![ScanEffect::Record { log, write: None }];
            effects.extend(self.finish(Err(failure)));
            return effects;
        }
        self.position = reading;
        self.phase = Phase::LoadingTemplate;
        vec![ScanEffect::LoadTemplate]
    }

    pub fn on_template_loaded(
        &mut self,
        epoch: Epoch,
        result: Result<Option<FaceTemplate>, StoreError>,
    ) -> Vec<ScanEffect> {
        if !self.accepts(epoch, Phase::LoadingTemplate) {
            return Vec::new();
        }
        match result {
            Err(e) => self.finish(Err(ScanFailure::StoreUnavailable(e.to_string()))),
            Ok(None) => self.finish(Err(ScanFailure::NotRegistered)),
            Ok(Some(template)) if template.embeddings.is_empty() => self.finish(Err(ScanFailure::NotRegistered)),
            Ok(Some(template)) => {
                self.template = Some(template);
                self.liveness.reset();
                self.phase = Phase::Scanning;
                vec![ScanEffect::Prompt(ScanPrompt::Liveness(LivenessPrompt::BlinkOrSmile))]
            }
        }
    }

    /// Feed one frame while scanning. A passed liveness challenge hands this
    /// frame to `extractor` and the matcher exactly once.
    pub fn on_frame(&mut self, frame: &Frame, extractor: &mut dyn EmbeddingExtractor) -> Vec<ScanEffect> {
        if self.phase != Phase::Scanning {
            return Vec::new();
        }

        let face = match self.config.gate.assess(frame) {
            Ok(face) => face,
            Err(issue) => return vec![ScanEffect::Prompt(ScanPrompt::Face(issue))],
        };

        match self.liveness.on_frame(&face.landmarks) {
            LivenessEvent::Prompt(p) => vec![ScanEffect::Prompt(ScanPrompt::Liveness(p))],
            LivenessEvent::InFlight => Vec::new(),
            LivenessEvent::Passed(challenge) => {
                tracing::debug!(user = %self.user, ?challenge, "verifying live face");
                let probe = match extractor.extract(frame, face) {
                    Ok(probe) => probe,
                    Err(e) => return self.attempt_failed(AttemptFailure::ExtractionFailed(e.to_string()), None),
                };
                let Some(template) = self.template.as_ref() else {
                    return self.finish(Err(ScanFailure::NotRegistered));
                };
                let threshold = self.config.threshold.unwrap_or(extractor.scheme().default_threshold());
                let result = CosineMatcher.compare(&probe, template, threshold);
                tracing::info!(
                    user = %self.user,
                    similarity = result.similarity,
                    threshold,
                    reason = ?result.reason,
                    "match evaluated"
                );

                match result.reason {
                    MatchReason::Matched => self.verified(result.similarity),
                    MatchReason::BelowThreshold => {
                        self.attempt_failed(AttemptFailure::BelowThreshold, Some(result.similarity))
                    }
                    MatchReason::IncompatibleTemplate => {
                        let log = self.log_entry(false, None, Some("incompatible_template".into()), self.position);
                        let mut effects = vec![ScanEffect::Record { log, write: None }];
                        effects.extend(self.finish(Err(ScanFailure::IncompatibleTemplate)));
                        effects
                    }
                    MatchReason::NoEnrolledTemplate => self.finish(Err(ScanFailure::NotRegistered)),
                }
            }
        }
    }

    /// Completion of a [`ScanEffect::Record`] that carried a write.
    pub fn on_recorded(
        &mut self,
        epoch: Epoch,
        log_id: Option<Uuid>,
        write: Result<Uuid, StoreError>,
    ) -> Vec<ScanEffect> {
        if !self.accepts(epoch, Phase::Recording) {
            return Vec::new();
        }
        let (record_id, write_error) = match write {
            Ok(id) => (Some(id), None),
            Err(e) => {
                tracing::warn!(user = %self.user, error = %e, "attendance write failed after successful verification");
                (None, Some(e))
            }
        };
        let outcome = ScanOutcome {
            user: self.user.clone(),
            kind: self.kind,
            similarity: self.pending_similarity,
            log_id,
            record_id,
            write_error,
        };
        self.finish(Ok(outcome))
    }

    /// User backed out or the app went to the background. Nothing is written.
    pub fn cancel(&mut self) -> Vec<ScanEffect> {
        if matches!(self.phase, Phase::Done | Phase::Recording) {
            return Vec::new();
        }
        self.finish(Err(ScanFailure::Cancelled))
    }

    fn verified(&mut self, similarity: f32) -> Vec<ScanEffect> {
        self.retries.record_success();
        self.pending_similarity = similarity;
        self.phase = Phase::Recording;

        let now = Utc::now();
        let write = match self.session {
            SessionState::NoActiveSession => AttendanceWrite::CheckIn(CheckIn {
                user: self.user.clone(),
                at: now,
                similarity,
                log_id: None,
                position: self.position,
            }),
            SessionState::Active { session_id, .. } => AttendanceWrite::CheckOut(CheckOut {
                session_id,
                at: now,
                similarity,
                log_id: None,
                position: self.position,
            }),
        };
        let log = self.log_entry(true, Some(similarity), None, self.position);
        vec![ScanEffect::Record { log, write: Some(write) }]
    }

    fn attempt_failed(&mut self, reason: AttemptFailure, similarity: Option<f32>) -> Vec<ScanEffect> {
        let log = self.log_entry(false, similarity, Some(reason.code().to_string()), self.position);
        let mut effects = vec![ScanEffect::Record { log, write: None }];

        match self.retries.record_failure() {
            RetryDecision::Retry { remaining } => {
                tracing::info!(user = %self.user, reason = reason.code(), remaining, "verification attempt failed");
                self.liveness.verification_failed();
                effects.push(ScanEffect::AttemptFailed { reason, similarity, remaining });
            }
            RetryDecision::Exhausted => {
                let attempts = self.retries.consecutive_failures();
                tracing::warn!(user = %self.user, attempts, "retry budget exhausted");
                effects.extend(self.finish(Err(ScanFailure::ReRegisterRequired { attempts })));
            }
        }
        effects
    }

    fn finish(&mut self, result: Result<ScanOutcome, ScanFailure>) -> Vec<ScanEffect> {
        self.phase = Phase::Done;
        self.liveness.reset();
        self.template = None;
        vec![ScanEffect::Finished(result)]
    }

    fn accepts(&self, epoch: Epoch, phase: Phase) -> bool {
        if epoch != self.epoch {
            tracing::debug!(expected = self.epoch.0, got = epoch.0, "discarding stale completion");
            return false;
        }
        self.phase == phase
    }

    fn log_entry(
        &self,
        success: bool,
        similarity: Option<f32>,
        error: Option<String>,
        position: Option<PositionReading>,
    ) -> ScanLogEntry {
        ScanLogEntry {
            user: self.user.clone(),
            scan_type: ScanType::Attendance,
            success,
            similarity,
            error,
            position,
            at: Utc::now(),
        }
    }
}
