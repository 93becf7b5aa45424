use presence_core::attendance::{ScanConfig, DEFAULT_ALLOWED_FAILURES};
use presence_core::capture::{CaptureConfig, PoseSequence, PoseWindows};
use presence_core::liveness::LivenessThresholds;
use presence_core::quality::QualityGate;
use presence_core::{EmbeddingScheme, Geofence};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("learned embedding scheme selected but no model path configured")]
    MissingModel,
    #[error("office geofence is invalid: {0}")]
    InvalidOffice(&'static str),
}

/// Runtime configuration: optional TOML file, then `PRESENCE_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub scheme: EmbeddingScheme,
    /// ONNX embedding model, required for the learned scheme.
    pub model_path: Option<PathBuf>,
    /// Overrides the scheme's calibrated match threshold.
    pub similarity_threshold: Option<f32>,
    pub office: Geofence,
    pub pose_sequence: PoseSequence,
    pub hold_ms: u64,
    /// Minimum spacing between processed frames on the attendance screen.
    pub liveness_throttle_ms: u64,
    /// Minimum spacing between processed frames on the registration screen.
    pub registration_throttle_ms: u64,
    /// Screen timer period driving the hold countdown.
    pub tick_ms: u64,
    pub min_face_px: f32,
    pub position_timeout_secs: u64,
    pub store_timeout_secs: u64,
    /// Consecutive failed verifications tolerated before re-registration.
    pub max_failed_attempts: u32,
    pub yaw_left_sign: f32,
    pub pitch_up_sign: f32,
    /// Delay between replayed frames.
    pub replay_interval_ms: u64,
    /// Capacity of the frame channel; frames beyond it are dropped.
    pub frame_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        Self {
            db_path: data_dir.join("presence.db"),
            scheme: EmbeddingScheme::Geometric,
            model_path: None,
            similarity_threshold: None,
            office: Geofence {
                latitude: 0.0,
                longitude: 0.0,
                radius_m: 100.0,
            },
            pose_sequence: PoseSequence::Full,
            hold_ms: 1500,
            liveness_throttle_ms: 300,
            registration_throttle_ms: 100,
            tick_ms: 100,
            min_face_px: 80.0,
            position_timeout_secs: 10,
            store_timeout_secs: 5,
            max_failed_attempts: DEFAULT_ALLOWED_FAILURES,
            yaw_left_sign: 1.0,
            pitch_up_sign: 1.0,
            replay_interval_ms: 33,
            frame_buffer: 2,
        }
    }
}

impl Config {
    /// Load `path` if given, otherwise start from defaults, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `PRESENCE_*` environment variables on top of the current values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(scheme) = std::env::var("PRESENCE_SCHEME").ok().and_then(|v| v.parse().ok()) {
            self.scheme = scheme;
        }
        if let Ok(v) = std::env::var("PRESENCE_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(v));
        }
        if let Some(t) = env_opt_f32("PRESENCE_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = Some(t);
        }
        self.office.latitude = env_f64("PRESENCE_OFFICE_LATITUDE", self.office.latitude);
        self.office.longitude = env_f64("PRESENCE_OFFICE_LONGITUDE", self.office.longitude);
        self.office.radius_m = env_f64("PRESENCE_OFFICE_RADIUS_M", self.office.radius_m);
        if let Ok(v) = std::env::var("PRESENCE_POSE_SEQUENCE") {
            match v.as_str() {
                "full" => self.pose_sequence = PoseSequence::Full,
                "compact" => self.pose_sequence = PoseSequence::Compact,
                other => tracing::warn!(value = other, "ignoring unknown PRESENCE_POSE_SEQUENCE"),
            }
        }
        self.hold_ms = env_u64("PRESENCE_HOLD_MS", self.hold_ms);
        self.liveness_throttle_ms = env_u64("PRESENCE_LIVENESS_THROTTLE_MS", self.liveness_throttle_ms);
        self.registration_throttle_ms = env_u64("PRESENCE_REGISTRATION_THROTTLE_MS", self.registration_throttle_ms);
        self.tick_ms = env_u64("PRESENCE_TICK_MS", self.tick_ms);
        self.min_face_px = env_f32("PRESENCE_MIN_FACE_PX", self.min_face_px);
        self.position_timeout_secs = env_u64("PRESENCE_POSITION_TIMEOUT_SECS", self.position_timeout_secs);
        self.store_timeout_secs = env_u64("PRESENCE_STORE_TIMEOUT_SECS", self.store_timeout_secs);
        self.max_failed_attempts = env_u64("PRESENCE_MAX_FAILED_ATTEMPTS", self.max_failed_attempts as u64) as u32;
        self.yaw_left_sign = env_f32("PRESENCE_YAW_LEFT_SIGN", self.yaw_left_sign);
        self.pitch_up_sign = env_f32("PRESENCE_PITCH_UP_SIGN", self.pitch_up_sign);
        self.replay_interval_ms = env_u64("PRESENCE_REPLAY_INTERVAL_MS", self.replay_interval_ms);
        self.frame_buffer = env_usize("PRESENCE_FRAME_BUFFER", self.frame_buffer);
    }

    /// Reject combinations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheme == EmbeddingScheme::Learned && self.model_path.is_none() {
            return Err(ConfigError::MissingModel);
        }
        let office = &self.office;
        if !(office.latitude.is_finite() && (-90.0..=90.0).contains(&office.latitude)) {
            return Err(ConfigError::InvalidOffice("latitude out of range"));
        }
        if !(office.longitude.is_finite() && (-180.0..=180.0).contains(&office.longitude)) {
            return Err(ConfigError::InvalidOffice("longitude out of range"));
        }
        if !(office.radius_m.is_finite() && office.radius_m > 0.0) {
            return Err(ConfigError::InvalidOffice("radius must be positive"));
        }
        if self.office_is_placeholder() {
            tracing::warn!("office location not configured; every check-in and check-out will be outside the geofence");
        }
        Ok(())
    }

    /// The office still sits at the built-in (0, 0) placeholder.
    pub fn office_is_placeholder(&self) -> bool {
        self.office.latitude == 0.0 && self.office.longitude == 0.0
    }

    pub fn threshold(&self) -> f32 {
        self.similarity_threshold
            .unwrap_or(self.scheme.default_threshold())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sequence: self.pose_sequence,
            hold: Duration::from_millis(self.hold_ms),
            windows: PoseWindows {
                yaw_left_sign: self.yaw_left_sign,
                pitch_up_sign: self.pitch_up_sign,
                ..PoseWindows::default()
            },
            gate: QualityGate::capture(self.min_face_px),
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            geofence: self.office,
            threshold: self.similarity_threshold,
            gate: QualityGate::liveness(self.min_face_px),
            liveness: LivenessThresholds::default(),
            allowed_failures: self.max_failed_attempts,
        }
    }

    pub fn position_timeout(&self) -> Duration {
        Duration::from_secs(self.position_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_opt_f32(key).unwrap_or(default)
}

fn env_opt_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
