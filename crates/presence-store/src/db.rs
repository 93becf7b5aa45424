use crate::schema::{SCHEMA_V1, SCHEMA_VERSION};
use chrono::{DateTime, SecondsFormat, Utc};
use presence_core::geofence::PositionReading;
use presence_core::store::{
    AttendanceRecord, AttendanceStore, CheckIn, CheckOut, LoggedScan, ScanLogEntry, ScanLogStore, ScanType,
    StoreError, TemplateStore,
};
use presence_core::types::{Embedding, FaceTemplate};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

/// SQLite-backed template, attendance and scan-log store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        let db = Self::init(conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(DbError::UnsupportedSchema {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA_V1)?;
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
            tracing::debug!(from = version, to = SCHEMA_VERSION, "schema migrated");
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {e}"))
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", e))
}

fn parse_id(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| corrupt("id", e))
}

fn position_json(p: &Option<PositionReading>) -> Result<Option<String>, StoreError> {
    p.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| corrupt("position", e))
}

fn parse_position(s: Option<String>) -> Result<Option<PositionReading>, StoreError> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| corrupt("position", e))
}

fn parse_scan_type(s: &str) -> Result<ScanType, StoreError> {
    match s {
        "registration" => Ok(ScanType::Registration),
        "attendance" => Ok(ScanType::Attendance),
        other => Err(corrupt("scan type", other)),
    }
}

/// Attendance row as stored, decoded outside the rusqlite row closure.
struct AttendanceRow {
    id: String,
    user: String,
    check_in_at: String,
    check_in_similarity: f64,
    check_in_log: Option<String>,
    check_in_position: Option<String>,
    check_out_at: Option<String>,
    check_out_similarity: Option<f64>,
    check_out_log: Option<String>,
    check_out_position: Option<String>,
}

const ATTENDANCE_COLUMNS: &str = "id, user, check_in_at, check_in_similarity, check_in_log, check_in_position, \
     check_out_at, check_out_similarity, check_out_log, check_out_position";

impl AttendanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user: row.get(1)?,
            check_in_at: row.get(2)?,
            check_in_similarity: row.get(3)?,
            check_in_log: row.get(4)?,
            check_in_position: row.get(5)?,
            check_out_at: row.get(6)?,
            check_out_similarity: row.get(7)?,
            check_out_log: row.get(8)?,
            check_out_position: row.get(9)?,
        })
    }

    fn decode(self) -> Result<AttendanceRecord, StoreError> {
        Ok(AttendanceRecord {
            id: parse_id(&self.id)?,
            user: self.user,
            check_in_at: parse_ts(&self.check_in_at)?,
            check_in_similarity: self.check_in_similarity as f32,
            check_in_log: self.check_in_log.as_deref().map(parse_id).transpose()?,
            check_in_position: parse_position(self.check_in_position)?,
            check_out_at: self.check_out_at.as_deref().map(parse_ts).transpose()?,
            check_out_similarity: self.check_out_similarity.map(|s| s as f32),
            check_out_log: self.check_out_log.as_deref().map(parse_id).transpose()?,
            check_out_position: parse_position(self.check_out_position)?,
        })
    }
}

struct ScanLogRow {
    id: String,
    user: String,
    scan_type: String,
    success: bool,
    similarity: Option<f64>,
    error: Option<String>,
    position: Option<String>,
    at: String,
}

impl ScanLogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user: row.get(1)?,
            scan_type: row.get(2)?,
            success: row.get(3)?,
            similarity: row.get(4)?,
            error: row.get(5)?,
            position: row.get(6)?,
            at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<LoggedScan, StoreError> {
        Ok(LoggedScan {
            id: parse_id(&self.id)?,
            entry: ScanLogEntry {
                user: self.user,
                scan_type: parse_scan_type(&self.scan_type)?,
                success: self.success,
                similarity: self.similarity.map(|s| s as f32),
                error: self.error,
                position: parse_position(self.position)?,
                at: parse_ts(&self.at)?,
            },
        })
    }
}

impl TemplateStore for Database {
    fn get(&self, user: &str) -> Result<Option<FaceTemplate>, StoreError> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT embeddings, created_at FROM templates WHERE user = ?1",
                params![user],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(unavailable)?;

        let Some((embeddings, created_at)) = row else {
            return Ok(None);
        };
        let embeddings: Vec<Embedding> =
            serde_json::from_str(&embeddings).map_err(|e| corrupt("template embeddings", e))?;
        Ok(Some(FaceTemplate {
            user: user.to_string(),
            embeddings,
            created_at: parse_ts(&created_at)?,
        }))
    }

    fn save(&self, template: &FaceTemplate) -> Result<(), StoreError> {
        let scheme = template
            .embeddings
            .first()
            .map(|e| e.scheme().as_str())
            .unwrap_or("none");
        let embeddings =
            serde_json::to_string(&template.embeddings).map_err(|e| corrupt("template embeddings", e))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO templates (user, scheme, embeddings, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user) DO UPDATE SET
                scheme = excluded.scheme,
                embeddings = excluded.embeddings,
                created_at = excluded.created_at",
            params![template.user, scheme, embeddings, ts(&template.created_at)],
        )
        .map_err(unavailable)?;
        tracing::info!(user = %template.user, scheme, count = template.embeddings.len(), "template saved");
        Ok(())
    }

    fn delete(&self, user: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let n = conn
            .execute("DELETE FROM templates WHERE user = ?1", params![user])
            .map_err(unavailable)?;
        Ok(n > 0)
    }
}

impl AttendanceStore for Database {
    fn open_session(&self, user: &str) -> Result<Option<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE user = ?1 AND check_out_at IS NULL");
        let row = conn
            .query_row(&sql, params![user], AttendanceRow::from_row)
            .optional()
            .map_err(unavailable)?;
        row.map(AttendanceRow::decode).transpose()
    }

    fn create_check_in(&self, check_in: &CheckIn) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let position = position_json(&check_in.position)?;
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO attendance (id, user, check_in_at, check_in_similarity, check_in_log, check_in_position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                check_in.user,
                ts(&check_in.at),
                check_in.similarity as f64,
                check_in.log_id.map(|l| l.to_string()),
                position,
            ],
        );
        match result {
            Ok(_) => Ok(id),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::SessionAlreadyOpen(check_in.user.clone()))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    fn close_check_out(&self, check_out: &CheckOut) -> Result<(), StoreError> {
        let position = position_json(&check_out.position)?;
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE attendance SET
                    check_out_at = ?2,
                    check_out_similarity = ?3,
                    check_out_log = ?4,
                    check_out_position = ?5
                 WHERE id = ?1 AND check_out_at IS NULL",
                params![
                    check_out.session_id.to_string(),
                    ts(&check_out.at),
                    check_out.similarity as f64,
                    check_out.log_id.map(|l| l.to_string()),
                    position,
                ],
            )
            .map_err(unavailable)?;
        if n == 0 {
            return Err(StoreError::SessionNotOpen(check_out.session_id));
        }
        Ok(())
    }

    fn history(&self, user: &str, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE user = ?1 ORDER BY check_in_at DESC, rowid DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
        let rows = stmt
            .query_map(params![user, limit as i64], AttendanceRow::from_row)
            .map_err(unavailable)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(unavailable)?;
        rows.into_iter().map(AttendanceRow::decode).collect()
    }
}

impl ScanLogStore for Database {
    fn append(&self, entry: &ScanLogEntry) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let position = position_json(&entry.position)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scan_log (id, user, scan_type, success, similarity, error, position, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                entry.user,
                entry.scan_type.as_str(),
                entry.success,
                entry.similarity.map(|s| s as f64),
                entry.error,
                position,
                ts(&entry.at),
            ],
        )
        .map_err(unavailable)?;
        Ok(id)
    }

    fn recent(&self, user: &str, limit: usize) -> Result<Vec<LoggedScan>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user, scan_type, success, similarity, error, position, at
                 FROM scan_log WHERE user = ?1 ORDER BY seq DESC LIMIT ?2",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![user, limit as i64], ScanLogRow::from_row)
            .map_err(unavailable)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(unavailable)?;
        rows.into_iter().map(ScanLogRow::decode).collect()
    }
}
