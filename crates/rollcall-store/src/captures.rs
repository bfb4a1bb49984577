use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use rollcall_core::{CaptureOutcome, CaptureTrigger};

use crate::{parse_ts, ts, Database, StoreError};

/// A new entry for the append-only capture log.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub session_id: String,
    pub captured_at: DateTime<Utc>,
    pub motion_strength: f32,
    pub trigger: CaptureTrigger,
    pub outcome: CaptureOutcome,
}

/// A persisted capture event. The recognition columns stay null until
/// the asynchronous dispatch for an admitted event settles.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub id: i64,
    pub session_id: String,
    pub captured_at: DateTime<Utc>,
    pub motion_strength: f32,
    pub trigger: CaptureTrigger,
    pub outcome: CaptureOutcome,
    pub faces_detected: Option<u32>,
    pub matches_recognized: Option<u32>,
    pub error: Option<String>,
}

/// Per-outcome capture counts for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub admitted: u32,
    pub blocked_cooldown: u32,
    pub blocked_rate_limit: u32,
    pub blocked_duplicate_trigger: u32,
}

fn row_to_capture(row: &Row) -> Result<CaptureEvent, StoreError> {
    let captured_at: String = row.get("captured_at")?;
    let trigger: String = row.get("trigger_kind")?;
    let outcome: String = row.get("outcome")?;

    let trigger = match trigger.as_str() {
        "motion" => CaptureTrigger::Motion,
        "manual" => CaptureTrigger::Manual,
        "stream" => CaptureTrigger::Stream,
        other => return Err(StoreError::Corrupt(format!("unknown trigger '{other}'"))),
    };

    Ok(CaptureEvent {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        captured_at: parse_ts(&captured_at, "captured_at")?,
        motion_strength: row.get("motion_strength")?,
        trigger,
        outcome: CaptureOutcome::parse(&outcome).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        faces_detected: row.get::<_, Option<i64>>("faces_detected")?.map(|v| v as u32),
        matches_recognized: row
            .get::<_, Option<i64>>("matches_recognized")?
            .map(|v| v as u32),
        error: row.get("error")?,
    })
}

impl Database {
    /// Append a capture event; returns its row id.
    pub async fn record_capture(&self, capture: NewCapture) -> Result<i64, StoreError> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO capture_events
                     (session_id, captured_at, motion_strength, trigger_kind, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    capture.session_id,
                    ts(capture.captured_at),
                    capture.motion_strength as f64,
                    capture.trigger.as_str(),
                    capture.outcome.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Fill in the recognition response for an admitted capture. The
    /// outcome itself is never rewritten.
    pub async fn complete_capture(
        &self,
        capture_id: i64,
        faces_detected: Option<u32>,
        matches_recognized: Option<u32>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE capture_events
                 SET faces_detected = ?1, matches_recognized = ?2, error = ?3
                 WHERE id = ?4",
                params![
                    faces_detected.map(|v| v as i64),
                    matches_recognized.map(|v| v as i64),
                    error,
                    capture_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn captures_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<CaptureEvent>, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, captured_at, motion_strength, trigger_kind, outcome,
                        faces_detected, matches_recognized, error
                 FROM capture_events
                 WHERE session_id = ?1 ORDER BY captured_at, id",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_capture(row)?);
            }
            Ok(events)
        })
        .await
    }

    pub async fn capture_stats(&self, session_id: &str) -> Result<CaptureStats, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT outcome, COUNT(*) AS n FROM capture_events
                 WHERE session_id = ?1 GROUP BY outcome",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let mut stats = CaptureStats::default();
            while let Some(row) = rows.next()? {
                let outcome: String = row.get("outcome")?;
                let count: i64 = row.get("n")?;
                let count = count as u32;
                match CaptureOutcome::parse(&outcome)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?
                {
                    CaptureOutcome::Admitted => stats.admitted = count,
                    CaptureOutcome::BlockedCooldown => stats.blocked_cooldown = count,
                    CaptureOutcome::BlockedRateLimit => stats.blocked_rate_limit = count,
                    CaptureOutcome::BlockedDuplicateTrigger => {
                        stats.blocked_duplicate_trigger = count
                    }
                }
            }
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{sample_session, store};

    fn capture(session_id: &str, outcome: CaptureOutcome) -> NewCapture {
        NewCapture {
            session_id: session_id.to_string(),
            captured_at: Utc::now(),
            motion_strength: 0.42,
            trigger: CaptureTrigger::Motion,
            outcome,
        }
    }

    #[tokio::test]
    async fn test_capture_log_append_and_complete() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        let id = db
            .record_capture(capture(&session.id, CaptureOutcome::Admitted))
            .await
            .unwrap();

        // Response columns start null
        let events = db.captures_for_session(&session.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].faces_detected.is_none());

        db.complete_capture(id, Some(3), Some(2), None).await.unwrap();

        let events = db.captures_for_session(&session.id).await.unwrap();
        assert_eq!(events[0].faces_detected, Some(3));
        assert_eq!(events[0].matches_recognized, Some(2));
        assert!(events[0].error.is_none());
        // Outcome untouched
        assert_eq!(events[0].outcome, CaptureOutcome::Admitted);
    }

    #[tokio::test]
    async fn test_capture_failure_reason_recorded() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        let id = db
            .record_capture(capture(&session.id, CaptureOutcome::Admitted))
            .await
            .unwrap();
        db.complete_capture(id, None, None, Some("recognizer timeout".into()))
            .await
            .unwrap();

        let events = db.captures_for_session(&session.id).await.unwrap();
        assert_eq!(events[0].error.as_deref(), Some("recognizer timeout"));
    }

    #[tokio::test]
    async fn test_capture_stats_by_outcome() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        for outcome in [
            CaptureOutcome::Admitted,
            CaptureOutcome::Admitted,
            CaptureOutcome::BlockedCooldown,
            CaptureOutcome::BlockedRateLimit,
        ] {
            db.record_capture(capture(&session.id, outcome)).await.unwrap();
        }

        let stats = db.capture_stats(&session.id).await.unwrap();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.blocked_cooldown, 1);
        assert_eq!(stats.blocked_rate_limit, 1);
        assert_eq!(stats.blocked_duplicate_trigger, 0);
    }
}
