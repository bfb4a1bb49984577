use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, Row};

use rollcall_core::{Session, SessionConfig, SessionMode, SessionStatus};

use crate::{parse_ts, ts, Database, StoreError};

const SESSION_COLUMNS: &str = "id, class_id, teacher, mode, status, started_at, ended_at, \
     motion_threshold, cooldown_secs, on_time_limit_mins, max_events_per_hour, duration_mins";

fn row_to_session(row: &Row) -> Result<Session, StoreError> {
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;

    Ok(Session {
        id: row.get("id")?,
        class_id: row.get("class_id")?,
        teacher: row.get("teacher")?,
        mode: SessionMode::parse(&mode).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        status: SessionStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        started_at: parse_ts(&started_at, "started_at")?,
        ended_at: ended_at.map(|v| parse_ts(&v, "ended_at")).transpose()?,
        config: SessionConfig {
            motion_threshold: row.get("motion_threshold")?,
            cooldown_secs: row.get::<_, i64>("cooldown_secs")? as u64,
            on_time_limit_mins: row.get::<_, i64>("on_time_limit_mins")? as u64,
            max_events_per_hour: row.get::<_, i64>("max_events_per_hour")? as u32,
            duration_mins: row.get::<_, i64>("duration_mins")? as u64,
        },
    })
}

impl Database {
    /// Insert a new session. The partial unique index on
    /// `(class_id) WHERE status = 'active'` backstops the one-active-
    /// session-per-class invariant even if two starts race.
    pub async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let record = session.clone();
        self.execute(move |conn| {
            let result = conn.execute(
                "INSERT INTO sessions (id, class_id, teacher, mode, status, started_at, ended_at,
                     motion_threshold, cooldown_secs, on_time_limit_mins, max_events_per_hour, duration_mins)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id,
                    record.class_id,
                    record.teacher,
                    record.mode.as_str(),
                    record.status.as_str(),
                    ts(record.started_at),
                    record.ended_at.map(ts),
                    record.config.motion_threshold as f64,
                    record.config.cooldown_secs as i64,
                    record.config.on_time_limit_mins as i64,
                    record.config.max_events_per_hour as i64,
                    record.config.duration_mins as i64,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::ActiveSessionExists)
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn active_session_for_class(
        &self,
        class_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let class_id = class_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE class_id = ?1 AND status = 'active'"
            ))?;
            let mut rows = stmt.query(params![class_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'active' ORDER BY started_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Transition an active session to `ended` or `cancelled`.
    ///
    /// Returns `true` if this call performed the transition, `false` if
    /// the session was already closed; the caller uses that to run
    /// finalization exactly once and treat repeat stops as no-ops.
    pub async fn close_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1, ended_at = ?2
                 WHERE id = ?3 AND status = 'active'",
                params![status.as_str(), ts(ended_at), session_id],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{sample_session, store};

    #[tokio::test]
    async fn test_session_round_trip() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        let loaded = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.class_id, "c-101");
        assert_eq!(loaded.mode, SessionMode::MotionTriggered);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.config.cooldown_secs, 30);
        assert!(loaded.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_second_active_session_rejected() {
        let db = store().await;
        db.insert_session(&sample_session("c-101")).await.unwrap();

        let err = db
            .insert_session(&sample_session("c-101"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ActiveSessionExists));

        // A different class is unaffected
        db.insert_session(&sample_session("c-202")).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_session_allowed_after_close() {
        let db = store().await;
        let first = sample_session("c-101");
        db.insert_session(&first).await.unwrap();
        assert!(db
            .close_session(&first.id, SessionStatus::Ended, Utc::now())
            .await
            .unwrap());

        db.insert_session(&sample_session("c-101")).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        assert!(db
            .close_session(&session.id, SessionStatus::Ended, Utc::now())
            .await
            .unwrap());
        // Second close reports "nothing to do"
        assert!(!db
            .close_session(&session.id, SessionStatus::Ended, Utc::now())
            .await
            .unwrap());
        // And cancelling an ended session does not resurrect it
        assert!(!db
            .close_session(&session.id, SessionStatus::Cancelled, Utc::now())
            .await
            .unwrap());

        let loaded = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_active_session_lookup() {
        let db = store().await;
        assert!(db
            .active_session_for_class("c-101")
            .await
            .unwrap()
            .is_none());

        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();
        let found = db
            .active_session_for_class("c-101")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, session.id);

        db.close_session(&session.id, SessionStatus::Cancelled, Utc::now())
            .await
            .unwrap();
        assert!(db
            .active_session_for_class("c-101")
            .await
            .unwrap()
            .is_none());
    }
}
