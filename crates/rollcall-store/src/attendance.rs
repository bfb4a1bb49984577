use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use rollcall_core::{AttendanceStatus, DetectionMethod};

use crate::{parse_ts, ts, Database, StoreError};

/// A check-in to record. Whether it lands is decided by the uniqueness
/// constraint, not the caller.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub session_id: String,
    pub student_id: String,
    pub checked_in_at: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub method: Option<DetectionMethod>,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct AttendanceRecord {
    pub id: i64,
    pub session_id: String,
    pub student_id: String,
    /// Joined from the roster snapshot; null if the student was
    /// recognized but is not enrolled in the class.
    pub display_name: Option<String>,
    pub checked_in_at: DateTime<Utc>,
    pub status: AttendanceStatus,
    pub method: Option<DetectionMethod>,
    pub confidence: f32,
}

fn row_to_record(row: &Row) -> Result<AttendanceRecord, StoreError> {
    let checked_in_at: String = row.get("checked_in_at")?;
    let status: String = row.get("status")?;
    let method: Option<String> = row.get("method")?;

    Ok(AttendanceRecord {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        student_id: row.get("student_id")?,
        display_name: row.get("display_name")?,
        checked_in_at: parse_ts(&checked_in_at, "checked_in_at")?,
        status: AttendanceStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        method: method
            .map(|m| DetectionMethod::parse(&m).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()?,
        confidence: row.get("confidence")?,
    })
}

const RECORD_QUERY: &str = "SELECT a.id, a.session_id, a.student_id, r.display_name,
            a.checked_in_at, a.status, a.method, a.confidence
     FROM attendance_records a
     JOIN sessions s ON s.id = a.session_id
     LEFT JOIN roster r ON r.class_id = s.class_id AND r.student_id = a.student_id";

impl Database {
    /// Atomic check-and-insert. Returns `true` if the record was
    /// created, `false` if the student was already recorded for the
    /// session, which is the normal duplicate-detection discard path, not an
    /// error.
    pub async fn insert_attendance(&self, record: NewAttendance) -> Result<bool, StoreError> {
        self.execute(move |conn| {
            let changed = conn.execute(
                "INSERT INTO attendance_records
                     (session_id, student_id, checked_in_at, status, method, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (session_id, student_id) DO NOTHING",
                params![
                    record.session_id,
                    record.student_id,
                    ts(record.checked_in_at),
                    record.status.as_str(),
                    record.method.map(|m| m.as_str()),
                    record.confidence as f64,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    pub async fn attendance_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{RECORD_QUERY} WHERE a.session_id = ?1 ORDER BY a.checked_in_at, a.id"
            ))?;
            let mut rows = stmt.query(params![session_id])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    /// Records inserted after the given row id, oldest check-in first.
    /// The id watermark tracks insertion order, so a record whose
    /// check-in timestamp predates already-returned rows (a recognition
    /// reply that arrived late) still comes back on the next call.
    /// Start from 0 to get everything.
    pub async fn attendance_since(
        &self,
        session_id: &str,
        after_id: i64,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{RECORD_QUERY} WHERE a.session_id = ?1 AND a.id > ?2
                 ORDER BY a.checked_in_at, a.id"
            ))?;
            let mut rows = stmt.query(params![session_id, after_id])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_record(row)?);
            }
            Ok(records)
        })
        .await
    }

    /// Finalization: one `absent` row for every roster entry without a
    /// record. Safe to call more than once; the anti-join makes repeats
    /// insert nothing.
    pub async fn finalize_absent(
        &self,
        session_id: &str,
        class_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let session_id = session_id.to_string();
        let class_id = class_id.to_string();
        self.execute(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO attendance_records
                     (session_id, student_id, checked_in_at, status, method, confidence)
                 SELECT ?1, r.student_id, ?2, 'absent', NULL, 0.0
                 FROM roster r
                 WHERE r.class_id = ?3
                   AND NOT EXISTS (
                       SELECT 1 FROM attendance_records a
                       WHERE a.session_id = ?1 AND a.student_id = r.student_id
                   )",
                params![session_id, ts(ended_at), class_id],
            )?;
            Ok(inserted)
        })
        .await
    }

    /// (present, late, absent) counts for a session.
    pub async fn attendance_counts(
        &self,
        session_id: &str,
    ) -> Result<(u32, u32, u32), StoreError> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) AS n FROM attendance_records
                 WHERE session_id = ?1 GROUP BY status",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            let (mut present, mut late, mut absent) = (0u32, 0u32, 0u32);
            while let Some(row) = rows.next()? {
                let status: String = row.get("status")?;
                let count = row.get::<_, i64>("n")? as u32;
                match AttendanceStatus::parse(&status)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?
                {
                    AttendanceStatus::Present => present = count,
                    AttendanceStatus::Late => late = count,
                    AttendanceStatus::Absent => absent = count,
                }
            }
            Ok((present, late, absent))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{sample_session, store};
    use rollcall_core::RosterEntry;

    fn check_in(session_id: &str, student_id: &str, method: DetectionMethod) -> NewAttendance {
        NewAttendance {
            session_id: session_id.to_string(),
            student_id: student_id.to_string(),
            checked_in_at: Utc::now(),
            status: AttendanceStatus::Present,
            method: Some(method),
            confidence: 0.9,
        }
    }

    fn entry(id: &str, name: &str) -> RosterEntry {
        RosterEntry {
            student_id: id.to_string(),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_repeat_detections_yield_one_record() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        // Five detections of the same student in one session
        let mut inserted = 0;
        for _ in 0..5 {
            if db
                .insert_attendance(check_in(&session.id, "s1", DetectionMethod::Motion))
                .await
                .unwrap()
            {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        let records = db.attendance_for_session(&session.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].student_id, "s1");
    }

    #[tokio::test]
    async fn test_motion_and_manual_race_keeps_first() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        assert!(db
            .insert_attendance(check_in(&session.id, "s1", DetectionMethod::Motion))
            .await
            .unwrap());
        assert!(!db
            .insert_attendance(check_in(&session.id, "s1", DetectionMethod::Manual))
            .await
            .unwrap());

        let records = db.attendance_for_session(&session.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, Some(DetectionMethod::Motion));
    }

    #[tokio::test]
    async fn test_same_student_different_sessions_ok() {
        let db = store().await;
        let a = sample_session("c-101");
        let b = sample_session("c-202");
        db.insert_session(&a).await.unwrap();
        db.insert_session(&b).await.unwrap();

        assert!(db
            .insert_attendance(check_in(&a.id, "s1", DetectionMethod::Motion))
            .await
            .unwrap());
        assert!(db
            .insert_attendance(check_in(&b.id, "s1", DetectionMethod::Motion))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_finalize_marks_unrecorded_students_absent() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();
        db.replace_roster(
            "c-101",
            vec![entry("s1", "Ada"), entry("s2", "Bea"), entry("s3", "Cy")],
        )
        .await
        .unwrap();

        db.insert_attendance(check_in(&session.id, "s2", DetectionMethod::Motion))
            .await
            .unwrap();

        let ended_at = Utc::now();
        let inserted = db
            .finalize_absent(&session.id, "c-101", ended_at)
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let records = db.attendance_for_session(&session.id).await.unwrap();
        assert_eq!(records.len(), 3);
        let absent: Vec<_> = records
            .iter()
            .filter(|r| r.status == AttendanceStatus::Absent)
            .collect();
        assert_eq!(absent.len(), 2);
        for record in absent {
            assert!(record.method.is_none());
            assert_eq!(record.confidence, 0.0);
        }
    }

    #[tokio::test]
    async fn test_finalize_twice_inserts_nothing_new() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();
        db.replace_roster("c-101", vec![entry("s1", "Ada")])
            .await
            .unwrap();

        assert_eq!(
            db.finalize_absent(&session.id, "c-101", Utc::now())
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            db.finalize_absent(&session.id, "c-101", Utc::now())
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            db.attendance_for_session(&session.id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_attendance_since_watermark_and_order() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        let base = Utc::now();
        for (i, student) in ["s1", "s2", "s3"].iter().enumerate() {
            db.insert_attendance(NewAttendance {
                session_id: session.id.clone(),
                student_id: student.to_string(),
                checked_in_at: base + chrono::Duration::seconds(i as i64 * 10),
                status: AttendanceStatus::Present,
                method: Some(DetectionMethod::Motion),
                confidence: 0.8,
            })
            .await
            .unwrap();
        }

        let all = db.attendance_since(&session.id, 0).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);

        // Watermark is exclusive: everything inserted after s1's row
        let tail = db.attendance_since(&session.id, all[0].id).await.unwrap();
        let ids: Vec<&str> = tail.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s3"]);
    }

    #[tokio::test]
    async fn test_attendance_since_returns_late_insert_with_earlier_timestamp() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();

        let base = Utc::now();
        db.insert_attendance(NewAttendance {
            session_id: session.id.clone(),
            student_id: "s1".to_string(),
            checked_in_at: base,
            status: AttendanceStatus::Present,
            method: Some(DetectionMethod::Manual),
            confidence: 1.0,
        })
        .await
        .unwrap();
        let seen = db.attendance_since(&session.id, 0).await.unwrap();
        assert_eq!(seen.len(), 1);

        // A motion record lands later but is stamped with its capture
        // time, which predates the record already returned.
        db.insert_attendance(NewAttendance {
            session_id: session.id.clone(),
            student_id: "s2".to_string(),
            checked_in_at: base - chrono::Duration::seconds(5),
            status: AttendanceStatus::Present,
            method: Some(DetectionMethod::Motion),
            confidence: 0.9,
        })
        .await
        .unwrap();

        let tail = db.attendance_since(&session.id, seen[0].id).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].student_id, "s2");
    }

    #[tokio::test]
    async fn test_display_name_joined_from_roster() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();
        db.replace_roster("c-101", vec![entry("s1", "Ada")])
            .await
            .unwrap();

        db.insert_attendance(check_in(&session.id, "s1", DetectionMethod::Motion))
            .await
            .unwrap();
        db.insert_attendance(check_in(&session.id, "stranger", DetectionMethod::Manual))
            .await
            .unwrap();

        let records = db.attendance_for_session(&session.id).await.unwrap();
        let ada = records.iter().find(|r| r.student_id == "s1").unwrap();
        assert_eq!(ada.display_name.as_deref(), Some("Ada"));
        let stranger = records.iter().find(|r| r.student_id == "stranger").unwrap();
        assert!(stranger.display_name.is_none());
    }

    #[tokio::test]
    async fn test_counts_by_status() {
        let db = store().await;
        let session = sample_session("c-101");
        db.insert_session(&session).await.unwrap();
        db.replace_roster(
            "c-101",
            vec![entry("s1", "Ada"), entry("s2", "Bea"), entry("s3", "Cy")],
        )
        .await
        .unwrap();

        db.insert_attendance(check_in(&session.id, "s1", DetectionMethod::Motion))
            .await
            .unwrap();
        db.insert_attendance(NewAttendance {
            status: AttendanceStatus::Late,
            ..check_in(&session.id, "s2", DetectionMethod::Manual)
        })
        .await
        .unwrap();
        db.finalize_absent(&session.id, "c-101", Utc::now())
            .await
            .unwrap();

        assert_eq!(db.attendance_counts(&session.id).await.unwrap(), (1, 1, 1));
    }
}
