//! Blink/smile liveness challenge.
//!
//! Either signal defeats a printed or displayed photo. The machine is fed
//! quality-gated frames and reports when a challenge has been completed;
//! from then on it stays in [`LivenessState::VerifyingMatch`] and ignores
//! frames until the caller reports the verification outcome.

use crate::types::LandmarkSet;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    AwaitingChallenge,
    /// Eyes seen closed; waiting for them to reopen.
    ChallengeDetected,
    /// A challenge passed and a verification is in flight.
    VerifyingMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Challenge {
    Smile,
    Blink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessPrompt {
    BlinkOrSmile,
    KeepBlinking,
    OpenEyes,
}

impl LivenessPrompt {
    pub fn message(self) -> &'static str {
        match self {
            LivenessPrompt::BlinkOrSmile => "blink or smile",
            LivenessPrompt::KeepBlinking => "keep blinking",
            LivenessPrompt::OpenEyes => "open eyes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    Prompt(LivenessPrompt),
    /// Challenge completed: hand this frame to extraction and matching.
    Passed(Challenge),
    /// A verification is already in flight; the frame was ignored.
    InFlight,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessThresholds {
    /// Smile probability above which the smile challenge passes.
    pub smile: f32,
    /// Both eye-open probabilities below this count as closed.
    pub eye_closed: f32,
    /// Either eye-open probability above this counts as reopened.
    pub eye_open: f32,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            smile: 0.6,
            eye_closed: 0.5,
            eye_open: 0.6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessMachine {
    state: LivenessState,
    eyes_were_closed: bool,
    thresholds: LivenessThresholds,
}

impl Default for LivenessMachine {
    fn default() -> Self {
        Self::new(LivenessThresholds::default())
    }
}

impl LivenessMachine {
    pub fn new(thresholds: LivenessThresholds) -> Self {
        Self {
            state: LivenessState::AwaitingChallenge,
            eyes_were_closed: false,
            thresholds,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn on_frame(&mut self, landmarks: &LandmarkSet) -> LivenessEvent {
        if self.state == LivenessState::VerifyingMatch {
            return LivenessEvent::InFlight;
        }

        let t = self.thresholds;

        if landmarks.smiling.is_some_and(|p| p > t.smile) {
            return self.pass(Challenge::Smile);
        }

        if landmarks.eyes_closed(t.eye_closed) {
            self.eyes_were_closed = true;
            self.state = LivenessState::ChallengeDetected;
            return LivenessEvent::Prompt(LivenessPrompt::OpenEyes);
        }

        if self.eyes_were_closed {
            if landmarks.either_eye_open(t.eye_open) {
                return self.pass(Challenge::Blink);
            }
            return LivenessEvent::Prompt(LivenessPrompt::OpenEyes);
        }

        let has_eye_data = landmarks.left_eye_open.is_some() || landmarks.right_eye_open.is_some();
        if has_eye_data && !landmarks.either_eye_open(t.eye_open) {
            LivenessEvent::Prompt(LivenessPrompt::KeepBlinking)
        } else {
            LivenessEvent::Prompt(LivenessPrompt::BlinkOrSmile)
        }
    }

    /// The in-flight verification finished without success; wait for a new
    /// challenge.
    pub fn verification_failed(&mut self) {
        self.reset();
    }

    /// Back to a fresh challenge, e.g. on screen entry or exit.
    pub fn reset(&mut self) {
        self.state = LivenessState::AwaitingChallenge;
        self.eyes_were_closed = false;
    }

    fn pass(&mut self, challenge: Challenge) -> LivenessEvent {
        tracing::debug!(?challenge, "liveness challenge passed");
        self.state = LivenessState::VerifyingMatch;
        self.eyes_were_closed = false;
        LivenessEvent::Passed(challenge)
    }
}
