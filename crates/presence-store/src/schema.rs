/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Idempotent DDL for version 1.
///
/// The partial unique index keeps at most one open session per user even if
/// two check-ins race past the session check. The scan log rejects updates
/// and deletes.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS templates (
    user        TEXT PRIMARY KEY,
    scheme      TEXT NOT NULL,
    embeddings  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id                    TEXT PRIMARY KEY,
    user                  TEXT NOT NULL,
    check_in_at           TEXT NOT NULL,
    check_in_similarity   REAL NOT NULL,
    check_in_log          TEXT,
    check_in_position     TEXT,
    check_out_at          TEXT,
    check_out_similarity  REAL,
    check_out_log         TEXT,
    check_out_position    TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS attendance_one_open
    ON attendance(user) WHERE check_out_at IS NULL;

CREATE INDEX IF NOT EXISTS attendance_by_user
    ON attendance(user, check_in_at);

CREATE TABLE IF NOT EXISTS scan_log (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    user        TEXT NOT NULL,
    scan_type   TEXT NOT NULL,
    success     INTEGER NOT NULL,
    similarity  REAL,
    error       TEXT,
    position    TEXT,
    at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS scan_log_by_user ON scan_log(user, seq);

CREATE TRIGGER IF NOT EXISTS scan_log_no_update
    BEFORE UPDATE ON scan_log
BEGIN
    SELECT RAISE(ABORT, 'scan_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS scan_log_no_delete
    BEFORE DELETE ON scan_log
BEGIN
    SELECT RAISE(ABORT, 'scan_log is append-only');
END;
"#;
