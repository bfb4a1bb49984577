//! Schema, applied idempotently at open. Migration tooling beyond
//! create-on-open is out of scope.

use rusqlite::Connection;

pub fn apply_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                  TEXT PRIMARY KEY,
            class_id            TEXT NOT NULL,
            teacher             TEXT NOT NULL,
            mode                TEXT NOT NULL,
            status              TEXT NOT NULL,
            started_at          TEXT NOT NULL,
            ended_at            TEXT,
            motion_threshold    REAL NOT NULL,
            cooldown_secs       INTEGER NOT NULL,
            on_time_limit_mins  INTEGER NOT NULL,
            max_events_per_hour INTEGER NOT NULL,
            duration_mins       INTEGER NOT NULL
        );

        -- At most one active session per class, enforced at the store level.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
            ON sessions(class_id) WHERE status = 'active';

        CREATE TABLE IF NOT EXISTS roster (
            class_id     TEXT NOT NULL,
            student_id   TEXT NOT NULL,
            display_name TEXT NOT NULL,
            PRIMARY KEY (class_id, student_id)
        );

        -- Append-only capture log. Outcome is terminal; only the
        -- recognition response columns of an admitted event are filled
        -- in after the fact.
        CREATE TABLE IF NOT EXISTS capture_events (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id         TEXT NOT NULL REFERENCES sessions(id),
            captured_at        TEXT NOT NULL,
            motion_strength    REAL NOT NULL,
            trigger_kind       TEXT NOT NULL,
            outcome            TEXT NOT NULL,
            faces_detected     INTEGER,
            matches_recognized INTEGER,
            error              TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_captures_session
            ON capture_events(session_id, captured_at);

        CREATE TABLE IF NOT EXISTS attendance_records (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id    TEXT NOT NULL REFERENCES sessions(id),
            student_id    TEXT NOT NULL,
            checked_in_at TEXT NOT NULL,
            status        TEXT NOT NULL,
            method        TEXT,
            confidence    REAL NOT NULL,
            UNIQUE (session_id, student_id)
        );

        CREATE INDEX IF NOT EXISTS idx_attendance_session_time
            ON attendance_records(session_id, checked_in_at);",
    )
}
