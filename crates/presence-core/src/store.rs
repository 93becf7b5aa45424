//! Contracts for the external collaborators: template, attendance and scan
//! log persistence, and the position provider.
//!
//! All calls are blocking; the screen runtime runs them off the frame loop
//! with a timeout. [`memory`] holds in-process implementations.

use crate::geofence::{PositionError, PositionReading};
use crate::types::FaceTemplate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("user {0} already has an open attendance session")]
    SessionAlreadyOpen(String),
    #[error("attendance session {0} is not open")]
    SessionNotOpen(Uuid),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Registration,
    Attendance,
}

impl ScanType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanType::Registration => "registration",
            ScanType::Attendance => "attendance",
        }
    }
}

/// Audit record for one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanLogEntry {
    pub user: String,
    pub scan_type: ScanType,
    pub success: bool,
    pub similarity: Option<f32>,
    pub error: Option<String>,
    pub position: Option<PositionReading>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedScan {
    pub id: Uuid,
    #[serde(flatten)]
    pub entry: ScanLogEntry,
}

/// One attendance session; open while `check_out_at` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub user: String,
    pub check_in_at: DateTime<Utc>,
    pub check_in_similarity: f32,
    pub check_in_log: Option<Uuid>,
    pub check_in_position: Option<PositionReading>,
    pub check_out_at: Option<DateTime<Utc>>,
    pub check_out_similarity: Option<f32>,
    pub check_out_log: Option<Uuid>,
    pub check_out_position: Option<PositionReading>,
}

impl AttendanceRecord {
    pub fn is_open(&self) -> bool {
        self.check_out_at.is_none()
    }
}

/// Write request for a verified check-in.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckIn {
    pub user: String,
    pub at: DateTime<Utc>,
    pub similarity: f32,
    pub log_id: Option<Uuid>,
    pub position: Option<PositionReading>,
}

/// Write request closing an open session.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOut {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    pub similarity: f32,
    pub log_id: Option<Uuid>,
    pub position: Option<PositionReading>,
}

pub trait TemplateStore: Send + Sync {
    fn get(&self, user: &str) -> Result<Option<FaceTemplate>, StoreError>;

    /// Replace any previous template for the user.
    fn save(&self, template: &FaceTemplate) -> Result<(), StoreError>;

    /// Returns whether a template existed.
    fn delete(&self, user: &str) -> Result<bool, StoreError>;
}

pub trait AttendanceStore: Send + Sync {
    fn open_session(&self, user: &str) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Must refuse with [`StoreError::SessionAlreadyOpen`] if the user
    /// already has an open session.
    fn create_check_in(&self, check_in: &CheckIn) -> Result<Uuid, StoreError>;

    /// Stamp the check-out on an open session; the record is never replaced.
    fn close_check_out(&self, check_out: &CheckOut) -> Result<(), StoreError>;

    /// Most recent sessions first.
    fn history(&self, user: &str, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError>;
}

pub trait ScanLogStore: Send + Sync {
    fn append(&self, entry: &ScanLogEntry) -> Result<Uuid, StoreError>;

    /// Most recent entries first.
    fn recent(&self, user: &str, limit: usize) -> Result<Vec<LoggedScan>, StoreError>;
}

pub trait PositionProvider: Send + Sync {
    fn current(&self) -> Result<PositionReading, PositionError>;
}

/// A provider that always returns the same fix.
#[derive(Debug, Clone)]
pub struct FixedPosition(pub Result<PositionReading, PositionError>);

impl PositionProvider for FixedPosition {
    fn current(&self) -> Result<PositionReading, PositionError> {
        self.0.clone()
    }
}

pub mod memory {
    //! Mutex-backed stores for tests and dry runs. Each can be switched into
    //! a failing mode to exercise persistence errors.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, MutexGuard};

    fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
        m.lock().map_err(|_| StoreError::Unavailable("lock poisoned".into()))
    }

    fn check(failing: &AtomicBool) -> Result<(), StoreError> {
        if failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryTemplateStore {
        templates: Mutex<HashMap<String, FaceTemplate>>,
        failing: AtomicBool,
    }

    impl MemoryTemplateStore {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl TemplateStore for MemoryTemplateStore {
        fn get(&self, user: &str) -> Result<Option<FaceTemplate>, StoreError> {
            check(&self.failing)?;
            Ok(lock(&self.templates)?.get(user).cloned())
        }

        fn save(&self, template: &FaceTemplate) -> Result<(), StoreError> {
            check(&self.failing)?;
            lock(&self.templates)?.insert(template.user.clone(), template.clone());
            Ok(())
        }

        fn delete(&self, user: &str) -> Result<bool, StoreError> {
            check(&self.failing)?;
            Ok(lock(&self.templates)?.remove(user).is_some())
        }
    }

    #[derive(Default)]
    pub struct MemoryAttendanceStore {
        records: Mutex<Vec<AttendanceRecord>>,
        failing: AtomicBool,
    }

    impl MemoryAttendanceStore {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl AttendanceStore for MemoryAttendanceStore {
        fn open_session(&self, user: &str) -> Result<Option<AttendanceRecord>, StoreError> {
            check(&self.failing)?;
            Ok(lock(&self.records)?.iter().find(|r| r.user == user && r.is_open()).cloned())
        }

        fn create_check_in(&self, check_in: &CheckIn) -> Result<Uuid, StoreError> {
            check(&self.failing)?;
            let mut records = lock(&self.records)?;
            if records.iter().any(|r| r.user == check_in.user && r.is_open()) {
                return Err(StoreError::SessionAlreadyOpen(check_in.user.clone()));
            }
            let id = Uuid::new_v4();
            records.push(AttendanceRecord {
                id,
                user: check_in.user.clone(),
                check_in_at: check_in.at,
                check_in_similarity: check_in.similarity,
                check_in_log: check_in.log_id,
                check_in_position: check_in.position,
                check_out_at: None,
                check_out_similarity: None,
                check_out_log: None,
                check_out_position: None,
            });
            Ok(id)
        }

        fn close_check_out(&self, check_out: &CheckOut) -> Result<(), StoreError> {
            check(&self.failing)?;
            let mut records = lock(&self.records)?;
            let record = records
                .iter_mut()
                .find(|r| r.id == check_out.session_id && r.is_open())
                .ok_or(StoreError::SessionNotOpen(check_out.session_id))?;
            record.check_out_at = Some(check_out.at);
            record.check_out_similarity = Some(check_out.similarity);
            record.check_out_log = check_out.log_id;
            record.check_out_position = check_out.position;
            Ok(())
        }

        fn history(&self, user: &str, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
            check(&self.failing)?;
            let records = lock(&self.records)?;
            Ok(records.iter().rev().filter(|r| r.user == user).take(limit).cloned().collect())
        }
    }

    #[derive(Default)]
    pub struct MemoryScanLog {
        entries: Mutex<Vec<LoggedScan>>,
        failing: AtomicBool,
    }

    impl MemoryScanLog {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn len(&self) -> usize {
            self.entries.lock().map(|e| e.len()).unwrap_or(0)
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl ScanLogStore for MemoryScanLog {
        fn append(&self, entry: &ScanLogEntry) -> Result<Uuid, StoreError> {
            check(&self.failing)?;
            let id = Uuid::new_v4();
            lock(&self.entries)?.push(LoggedScan { id, entry: entry.clone() });
            Ok(id)
        }

        fn recent(&self, user: &str, limit: usize) -> Result<Vec<LoggedScan>, StoreError> {
            check(&self.failing)?;
            let entries = lock(&self.entries)?;
            Ok(entries.iter().rev().filter(|e| e.entry.user == user).take(limit).cloned().collect())
        }
    }
}
