use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use presence_core::attendance::ScanKind;
use presence_core::store::{AttendanceStore, FixedPosition, ScanLogStore, TemplateStore};
use presence_core::{
    EmbeddingExtractor, EmbeddingScheme, GeometricExtractor, LearnedExtractor, OnnxBackend, PositionError,
    PositionReading,
};
use presence_store::Database;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::{Config, ConfigError};
use engine::{replay_frames, RegistrationOutcome, Runtime, Stores};

#[derive(Parser)]
#[command(name = "presence", about = "Face-verified attendance", version)]
struct Cli {
    /// TOML configuration file; PRESENCE_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a multi-pose face template from a detector replay
    Register {
        #[arg(short, long)]
        user: String,
        /// JSONL detector output, one frame per line
        #[arg(short, long)]
        frames: PathBuf,
    },
    /// Verify the live face and open an attendance session
    CheckIn {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        frames: PathBuf,
        #[command(flatten)]
        position: PositionArgs,
    },
    /// Verify the live face and close the open attendance session
    CheckOut {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        frames: PathBuf,
        #[command(flatten)]
        position: PositionArgs,
    },
    /// Show registration and open-session state
    Status {
        #[arg(short, long)]
        user: String,
    },
    /// List recent attendance sessions and scan attempts
    History {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete the user's face template
    Reset {
        #[arg(short, long)]
        user: String,
    },
    /// Check a position against the configured office geofence
    Geofence {
        #[command(flatten)]
        position: PositionArgs,
    },
}

/// Position reported by the device. Without coordinates the provider
/// reports the position as unavailable.
#[derive(Args, Debug)]
struct PositionArgs {
    #[arg(long, allow_negative_numbers = true)]
    lat: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    lng: Option<f64>,
    /// Horizontal accuracy in meters
    #[arg(long)]
    accuracy: Option<f64>,
    /// The fix came from a mock-location provider
    #[arg(long)]
    mocked: bool,
    /// Simulate a disabled location service
    #[arg(long, conflicts_with_all = ["lat", "lng"])]
    location_disabled: bool,
}

impl PositionArgs {
    fn reading(&self) -> Result<PositionReading, PositionError> {
        if self.location_disabled {
            return Err(PositionError::ServiceDisabled);
        }
        match (self.lat, self.lng) {
            (Some(latitude), Some(longitude)) => Ok(PositionReading {
                latitude,
                longitude,
                is_mocked: self.mocked,
                accuracy_m: self.accuracy,
            }),
            _ => Err(PositionError::Unavailable("no position supplied (--lat/--lng)".into())),
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_extractor(config: &Config) -> Result<Box<dyn EmbeddingExtractor>> {
    match config.scheme {
        EmbeddingScheme::Geometric => Ok(Box::new(GeometricExtractor::default())),
        EmbeddingScheme::Learned => {
            let path = config.model_path.as_ref().ok_or(ConfigError::MissingModel)?;
            let backend = OnnxBackend::load(&path.to_string_lossy())
                .with_context(|| format!("loading embedding model {}", path.display()))?;
            Ok(Box::new(LearnedExtractor::new(backend)))
        }
    }
}

fn open_db(path: &Path) -> Result<Arc<Database>> {
    let db = Database::open(path).with_context(|| format!("opening database {}", path.display()))?;
    Ok(Arc::new(db))
}

fn stores(db: &Arc<Database>, position: Result<PositionReading, PositionError>) -> Stores {
    Stores {
        templates: db.clone(),
        attendance: db.clone(),
        scan_log: db.clone(),
        position: Arc::new(FixedPosition(position)),
    }
}

/// Flip the returned flag on ctrl-c.
fn cancel_on_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received; cancelling screen");
                let _ = tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

async fn run_scan(config: &Config, kind: ScanKind, user: &str, frames: &Path, position: &PositionArgs) -> Result<ExitCode> {
    let db = open_db(&config.db_path)?;
    let mut extractor = build_extractor(config)?;
    let frames = replay_frames(frames, Duration::from_millis(config.replay_interval_ms), config.frame_buffer).await?;
    let mut runtime = Runtime::new(config, stores(&db, position.reading()), cancel_on_interrupt());

    match runtime.scan(kind, user, extractor.as_mut(), frames).await {
        Ok(outcome) => {
            print_json(&json!({
                "status": "verified",
                "kind": outcome.kind,
                "user": outcome.user,
                "similarity": outcome.similarity,
                "record_id": outcome.record_id,
                "log_id": outcome.log_id,
                "write_error": outcome.write_error.as_ref().map(|e| e.to_string()),
            }))?;
            Ok(if outcome.write_error.is_some() { ExitCode::from(3) } else { ExitCode::SUCCESS })
        }
        Err(failure) => {
            let distance_m = match &failure {
                presence_core::ScanFailure::Location { distance_m, .. } => *distance_m,
                _ => None,
            };
            print_json(&json!({
                "status": "rejected",
                "kind": kind,
                "user": user,
                "code": failure.code(),
                "message": failure.to_string(),
                "retryable": failure.is_retryable(),
                "distance_m": distance_m,
            }))?;
            Ok(ExitCode::from(2))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;
    tracing::debug!(
        scheme = config.scheme.as_str(),
        threshold = config.threshold(),
        db = %config.db_path.display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::Register { user, frames } => {
            let db = open_db(&config.db_path)?;
            let mut extractor = build_extractor(&config)?;
            let frames =
                replay_frames(&frames, Duration::from_millis(config.replay_interval_ms), config.frame_buffer).await?;
            let no_position = Err(PositionError::Unavailable("not used during registration".into()));
            let mut runtime = Runtime::new(&config, stores(&db, no_position), cancel_on_interrupt());

            let outcome = runtime.register(&user, extractor.as_mut(), frames).await;
            print_json(&serde_json::to_value(&outcome)?)?;
            if matches!(outcome, RegistrationOutcome::Cancelled { .. }) {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::CheckIn { user, frames, position } => {
            return run_scan(&config, ScanKind::CheckIn, &user, &frames, &position).await;
        }
        Commands::CheckOut { user, frames, position } => {
            return run_scan(&config, ScanKind::CheckOut, &user, &frames, &position).await;
        }
        Commands::Status { user } => {
            let db = open_db(&config.db_path)?;
            let template = db.get(&user)?;
            let open = db.open_session(&user)?;
            print_json(&json!({
                "user": user,
                "registered": template.is_some(),
                "scheme": template.as_ref().and_then(|t| t.embeddings.first()).map(|e| e.scheme()),
                "registered_at": template.as_ref().map(|t| t.created_at),
                "active_scheme": config.scheme,
                "checked_in": open.is_some(),
                "open_session": open,
            }))?;
        }
        Commands::History { user, limit } => {
            let db = open_db(&config.db_path)?;
            print_json(&json!({
                "user": user,
                "sessions": db.history(&user, limit)?,
                "scans": db.recent(&user, limit)?,
            }))?;
        }
        Commands::Reset { user } => {
            let db = open_db(&config.db_path)?;
            let deleted = db.delete(&user)?;
            tracing::info!(user = %user, deleted, "template reset");
            print_json(&json!({ "user": user, "deleted": deleted }))?;
        }
        Commands::Geofence { position } => {
            let result = config.office.validate(&position.reading());
            print_json(&json!({
                "office": config.office,
                "result": result,
            }))?;
            if !result.valid {
                return Ok(ExitCode::from(2));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
