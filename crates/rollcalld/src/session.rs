//! Session lifecycle.
//!
//! One `SessionManager` owns every active session. Starting a session
//! validates its config, rejects a second active session per class,
//! snapshots the roster, opens the camera for automatic modes, and
//! spawns the session's capture and notifier tasks. Ending or
//! cancelling a session cancels those tasks first, then closes the row
//! and finalizes absentees exactly once; repeat stops are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rollcall_core::reconcile::{status_for_check_in, MANUAL_CONFIDENCE};
use rollcall_core::types::ConfigError;
use rollcall_core::{
    CaptureGate, CaptureOutcome, DetectionMethod, RosterEntry, Session, SessionConfig,
    SessionMode, SessionStatus,
};
use rollcall_hw::{Camera, CameraError};
use rollcall_store::{Database, NewAttendance, Roster, StoreError};

use crate::capture::{run_capture_loop, CaptureContext, ManualCapture};
use crate::config::Config;
use crate::recognizer::RecognitionClient;
use crate::sync::{run_notifier, AttendanceNotice, Notifier};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid session config: {0}")]
    Config(#[from] ConfigError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("no active session {0}")]
    UnknownSession(String),
    #[error("session has no camera; use manual check-in")]
    NoCamera,
    #[error("session task unavailable")]
    TaskGone,
}

/// Live counters for an active session, reported in status output.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub frames_sampled: AtomicU64,
    pub motion_events: AtomicU64,
    pub captures_admitted: AtomicU64,
}

struct SessionHandle {
    session: Session,
    cancel: CancellationToken,
    counters: Arc<SessionCounters>,
    notifier: Arc<Mutex<Notifier>>,
    roster_size: usize,
    /// None for standard sessions, which run no capture loop.
    manual_tx: Option<mpsc::Sender<ManualCapture>>,
}

/// Final report returned from an end or cancel request.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub class_id: String,
    pub status: SessionStatus,
    pub present: u32,
    pub late: u32,
    pub absent: u32,
}

/// One active session's line in the status report.
#[derive(Debug, Serialize)]
pub struct SessionStatusReport {
    pub session_id: String,
    pub class_id: String,
    pub teacher: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub roster_size: usize,
    pub frames_sampled: u64,
    pub motion_events: u64,
    pub captures_admitted: u64,
    pub captures_blocked_cooldown: u32,
    pub captures_blocked_rate_limit: u32,
    pub captures_blocked_duplicate: u32,
    pub present: u32,
    pub late: u32,
    pub absent: u32,
}

pub struct SessionManager {
    db: Database,
    recognizer: RecognitionClient,
    camera_device: String,
    accept_threshold: f32,
    sample_interval: Duration,
    poll_interval: Duration,
    notices: mpsc::UnboundedSender<AttendanceNotice>,
    active: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        db: Database,
        recognizer: RecognitionClient,
        config: &Config,
        notices: mpsc::UnboundedSender<AttendanceNotice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            recognizer,
            camera_device: config.camera_device.clone(),
            accept_threshold: config.accept_threshold,
            sample_interval: Duration::from_millis(config.sample_interval_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            notices,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Start a session for a class. Fails synchronously if the config is
    /// invalid, the class already has an active session, or an automatic
    /// mode cannot open the camera.
    pub async fn start_session(
        self: &Arc<Self>,
        class_id: &str,
        teacher: &str,
        mode: SessionMode,
        config: SessionConfig,
    ) -> Result<Session, SessionError> {
        config.validate()?;

        if self.db.active_session_for_class(class_id).await?.is_some() {
            return Err(StoreError::ActiveSessionExists.into());
        }

        // Open the camera before any row exists, so a dead device leaves
        // no half-started session behind. Standard mode never touches it.
        let camera = if mode.needs_camera() {
            Some(Camera::open(&self.camera_device)?)
        } else {
            None
        };

        let session = Session {
            id: Uuid::new_v4().to_string(),
            class_id: class_id.to_string(),
            teacher: teacher.to_string(),
            mode,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            config,
        };
        self.db.insert_session(&session).await?;

        let roster = self.db.snapshot(class_id).await?;
        if roster.is_empty() {
            tracing::warn!(class = class_id, "class has no roster; everyone will be unknown");
        }

        let cancel = CancellationToken::new();
        let counters = Arc::new(SessionCounters::default());
        let notifier = Arc::new(Mutex::new(Notifier::new(
            self.db.clone(),
            session.id.clone(),
            class_id.to_string(),
            self.notices.clone(),
        )));

        let manual_tx = match camera {
            Some(camera) => {
                let (manual_tx, manual_rx) = mpsc::channel::<ManualCapture>(4);
                let ctx = CaptureContext {
                    session: session.clone(),
                    db: self.db.clone(),
                    recognizer: self.recognizer.clone(),
                    gate: Arc::new(StdMutex::new(CaptureGate::new())),
                    counters: Arc::clone(&counters),
                    accept_threshold: self.accept_threshold,
                    cancel: cancel.clone(),
                };
                tokio::spawn(run_capture_loop(ctx, camera, self.sample_interval, manual_rx));
                Some(manual_tx)
            }
            None => None,
        };

        tokio::spawn(run_notifier(
            Arc::clone(&notifier),
            self.poll_interval,
            cancel.clone(),
        ));
        self.spawn_expiry(&session, cancel.clone());

        tracing::info!(
            session = %session.id,
            class = class_id,
            teacher,
            mode = mode.as_str(),
            roster = roster.len(),
            "session started"
        );

        let handle = SessionHandle {
            session: session.clone(),
            cancel,
            counters,
            notifier,
            roster_size: roster.len(),
            manual_tx,
        };
        self.active.lock().await.insert(session.id.clone(), handle);
        Ok(session)
    }

    /// Auto-expire the session when its configured duration runs out.
    fn spawn_expiry(self: &Arc<Self>, session: &Session, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        let session_id = session.id.clone();
        let deadline = Duration::from_secs(session.config.duration_mins * 60);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    tracing::info!(session = %session_id, "session duration elapsed; auto-ending");
                    if let Err(err) = manager.end_session(&session_id).await {
                        tracing::warn!(session = %session_id, error = %err, "auto-expiry failed");
                    }
                }
            }
        });
    }

    /// End a session. Stopping one that already ended is a no-op that
    /// reports the stored outcome.
    pub async fn end_session(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        self.finish(session_id, SessionStatus::Ended).await
    }

    /// Abort a session. Attendance recorded so far is kept and the
    /// remaining roster is still finalized as absent.
    pub async fn cancel_session(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        self.finish(session_id, SessionStatus::Cancelled).await
    }

    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<SessionSummary, SessionError> {
        let handle = self.active.lock().await.remove(session_id);

        // Cancel before finalization so a stale recognition reply cannot
        // add attendance to a session that is being closed.
        if let Some(handle) = &handle {
            handle.cancel.cancel();
        }

        let ended_at = Utc::now();
        let closed = self.db.close_session(session_id, status, ended_at).await?;
        let stored = self
            .db
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        if closed {
            let absent = self
                .db
                .finalize_absent(session_id, &stored.class_id, ended_at)
                .await?;
            tracing::info!(
                session = %session_id,
                status = status.as_str(),
                absent,
                "session closed"
            );
        } else {
            tracing::debug!(session = %session_id, "session already closed");
        }

        // Push the finalization rows out before reporting back.
        if let Some(handle) = &handle {
            if let Err(err) = handle.notifier.lock().await.poll_once().await {
                tracing::warn!(session = %session_id, error = %err, "final notifier drain failed");
            }
        }

        let (present, late, absent) = self.db.attendance_counts(session_id).await?;
        Ok(SessionSummary {
            session_id: session_id.to_string(),
            class_id: stored.class_id,
            status: stored.status,
            present,
            late,
            absent,
        })
    }

    /// Teacher-initiated capture, bypassing motion gating but not the
    /// in-flight limit. Only sessions with a camera accept it.
    pub async fn manual_capture(&self, session_id: &str) -> Result<CaptureOutcome, SessionError> {
        let manual_tx = {
            let active = self.active.lock().await;
            let handle = active
                .get(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            handle.manual_tx.clone().ok_or(SessionError::NoCamera)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        manual_tx
            .send(ManualCapture { reply: reply_tx })
            .await
            .map_err(|_| SessionError::TaskGone)?;
        Ok(reply_rx.await.map_err(|_| SessionError::TaskGone)??)
    }

    /// Record a student without the camera. Duplicate check-ins return
    /// `false` and change nothing.
    pub async fn manual_check_in(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<bool, SessionError> {
        let session = {
            let active = self.active.lock().await;
            active.get(session_id).map(|handle| handle.session.clone())
        }
        .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        let now = Utc::now();
        let status = status_for_check_in(session.started_at, now, session.config.on_time_limit_mins);
        let inserted = self
            .db
            .insert_attendance(NewAttendance {
                session_id: session.id.clone(),
                student_id: student_id.to_string(),
                checked_in_at: now,
                status,
                method: Some(DetectionMethod::Manual),
                confidence: MANUAL_CONFIDENCE,
            })
            .await?;

        if inserted {
            tracing::info!(
                session = %session.id,
                student = student_id,
                status = status.as_str(),
                "manual check-in recorded"
            );
        }
        Ok(inserted)
    }

    /// Replace the enrollment list for a class. Sessions started after
    /// this use the new list; finalization reads it as well.
    pub async fn set_roster(
        &self,
        class_id: &str,
        entries: Vec<RosterEntry>,
    ) -> Result<usize, SessionError> {
        let count = entries.len();
        self.db.replace_roster(class_id, entries).await?;
        tracing::info!(class = class_id, count, "roster replaced");
        Ok(count)
    }

    /// Status of every active session.
    pub async fn status(&self) -> Result<Vec<SessionStatusReport>, SessionError> {
        let handles: Vec<(Session, Arc<SessionCounters>, usize)> = {
            let active = self.active.lock().await;
            active
                .values()
                .map(|h| (h.session.clone(), Arc::clone(&h.counters), h.roster_size))
                .collect()
        };

        let mut reports = Vec::with_capacity(handles.len());
        for (session, counters, roster_size) in handles {
            let stats = self.db.capture_stats(&session.id).await?;
            let (present, late, absent) = self.db.attendance_counts(&session.id).await?;
            reports.push(SessionStatusReport {
                session_id: session.id.clone(),
                class_id: session.class_id.clone(),
                teacher: session.teacher.clone(),
                mode: session.mode,
                started_at: session.started_at,
                expires_at: session.expires_at(),
                roster_size,
                frames_sampled: counters.frames_sampled.load(Ordering::Relaxed),
                motion_events: counters.motion_events.load(Ordering::Relaxed),
                captures_admitted: counters.captures_admitted.load(Ordering::Relaxed),
                captures_blocked_cooldown: stats.blocked_cooldown,
                captures_blocked_rate_limit: stats.blocked_rate_limit,
                captures_blocked_duplicate: stats.blocked_duplicate_trigger,
                present,
                late,
                absent,
            });
        }
        reports.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(reports)
    }

    /// Close sessions left active by an earlier daemon run. Their tasks
    /// are gone, so they can only be finalized.
    pub async fn close_orphaned(&self) -> Result<usize, SessionError> {
        let orphans = self.db.active_sessions().await?;
        for session in &orphans {
            tracing::warn!(
                session = %session.id,
                class = %session.class_id,
                "closing session orphaned by a previous run"
            );
            self.end_session(&session.id).await?;
        }
        Ok(orphans.len())
    }

    /// End every active session, used at daemon shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.active.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.end_session(&id).await {
                tracing::warn!(session = %id, error = %err, "failed to end session at shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::RosterEntry;

    fn test_config() -> Config {
        Config {
            recognizer_url: "http://127.0.0.1:9/recognize".to_string(),
            db_path: "/tmp/unused.db".into(),
            camera_device: "/dev/null".to_string(),
            accept_threshold: 0.6,
            sample_interval_ms: 1000,
            poll_interval_ms: 50,
            recognize_timeout_secs: 1,
            recent_notices: 16,
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            motion_threshold: 0.1,
            cooldown_secs: 30,
            on_time_limit_mins: 15,
            max_events_per_hour: 120,
            duration_mins: 120,
        }
    }

    async fn manager() -> (
        Arc<SessionManager>,
        Database,
        mpsc::UnboundedReceiver<AttendanceNotice>,
    ) {
        let db = Database::open_in_memory().unwrap();
        let recognizer =
            RecognitionClient::new("http://127.0.0.1:9/recognize".to_string(), 1).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(db.clone(), recognizer, &test_config(), tx);
        (manager, db, rx)
    }

    fn entry(id: &str, name: &str) -> RosterEntry {
        RosterEntry {
            student_id: id.to_string(),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_second_active_session_rejected() {
        let (manager, _db, _rx) = manager().await;
        manager
            .start_session("c-101", "t-1", SessionMode::Standard, session_config())
            .await
            .unwrap();

        let err = manager
            .start_session("c-101", "t-2", SessionMode::Standard, session_config())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Store(StoreError::ActiveSessionExists)
        ));

        // A different class is unaffected.
        manager
            .start_session("c-202", "t-2", SessionMode::Standard, session_config())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_without_side_effects() {
        let (manager, db, _rx) = manager().await;
        let mut config = session_config();
        config.motion_threshold = 0.0;

        let err = manager
            .start_session("c-101", "t-1", SessionMode::Standard, config)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert!(db.active_session_for_class("c-101").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_finalizes_absent_and_is_idempotent() {
        let (manager, db, _rx) = manager().await;
        db.replace_roster("c-101", vec![entry("s1", "Ada"), entry("s2", "Bea")])
            .await
            .unwrap();

        let session = manager
            .start_session("c-101", "t-1", SessionMode::Standard, session_config())
            .await
            .unwrap();
        assert!(manager.manual_check_in(&session.id, "s1").await.unwrap());

        let summary = manager.end_session(&session.id).await.unwrap();
        assert_eq!(summary.status, SessionStatus::Ended);
        assert_eq!(summary.present, 1);
        assert_eq!(summary.absent, 1);

        // Stopping again is a no-op reporting the same totals.
        let again = manager.end_session(&session.id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Ended);
        assert_eq!(again.absent, 1);
        assert_eq!(
            db.attendance_for_session(&session.id).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_cancel_after_end_keeps_ended_status() {
        let (manager, _db, _rx) = manager().await;
        let session = manager
            .start_session("c-101", "t-1", SessionMode::Standard, session_config())
            .await
            .unwrap();

        manager.end_session(&session.id).await.unwrap();
        let summary = manager.cancel_session(&session.id).await.unwrap();
        assert_eq!(summary.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_duplicate_manual_check_in_reports_false() {
        let (manager, _db, _rx) = manager().await;
        let session = manager
            .start_session("c-101", "t-1", SessionMode::Standard, session_config())
            .await
            .unwrap();

        assert!(manager.manual_check_in(&session.id, "s1").await.unwrap());
        assert!(!manager.manual_check_in(&session.id, "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_capture_requires_camera() {
        let (manager, _db, _rx) = manager().await;
        let session = manager
            .start_session("c-101", "t-1", SessionMode::Standard, session_config())
            .await
            .unwrap();

        let err = manager.manual_capture(&session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::NoCamera));
    }

    #[tokio::test]
    async fn test_unknown_session_is_an_error() {
        let (manager, _db, _rx) = manager().await;
        assert!(matches!(
            manager.end_session("nope").await.unwrap_err(),
            SessionError::UnknownSession(_)
        ));
        assert!(matches!(
            manager.manual_check_in("nope", "s1").await.unwrap_err(),
            SessionError::UnknownSession(_)
        ));
    }

    #[tokio::test]
    async fn test_end_drains_notices_including_absent() {
        let (manager, db, mut rx) = manager().await;
        db.replace_roster("c-101", vec![entry("s1", "Ada"), entry("s2", "Bea")])
            .await
            .unwrap();

        let session = manager
            .start_session("c-101", "t-1", SessionMode::Standard, session_config())
            .await
            .unwrap();
        manager.manual_check_in(&session.id, "s1").await.unwrap();
        manager.end_session(&session.id).await.unwrap();

        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        assert_eq!(notices.len(), 2);
        assert!(notices
            .iter()
            .any(|n| n.student_id == "s2" && n.status == rollcall_core::AttendanceStatus::Absent));
    }

    #[tokio::test]
    async fn test_close_orphaned_finalizes_stale_actives() {
        let (manager, db, _rx) = manager().await;
        db.replace_roster("c-101", vec![entry("s1", "Ada")])
            .await
            .unwrap();

        // An active row with no running tasks, as left by a crashed run.
        let orphan = Session {
            id: Uuid::new_v4().to_string(),
            class_id: "c-101".to_string(),
            teacher: "t-1".to_string(),
            mode: SessionMode::Standard,
            status: SessionStatus::Active,
            started_at: Utc::now() - chrono::Duration::hours(3),
            ended_at: None,
            config: session_config(),
        };
        db.insert_session(&orphan).await.unwrap();

        assert_eq!(manager.close_orphaned().await.unwrap(), 1);
        let stored = db.get_session(&orphan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Ended);
        assert_eq!(db.attendance_counts(&orphan.id).await.unwrap(), (0, 0, 1));
    }
}
