use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use zbus::interface;

use rollcall_core::{RosterEntry, SessionMode};

use crate::config::Config;
use crate::session::{SessionError, SessionManager};
use crate::sync::AttendanceNotice;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    pub manager: Arc<SessionManager>,
    pub recent: Arc<Mutex<VecDeque<AttendanceNotice>>>,
}

/// Session knobs a start request may override; anything absent keeps
/// the daemon default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionOverrides {
    motion_threshold: Option<f32>,
    cooldown_secs: Option<u64>,
    on_time_limit_mins: Option<u64>,
    max_events_per_hour: Option<u32>,
    duration_mins: Option<u64>,
}

fn failed(err: SessionError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn invalid(message: String) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(message)
}

fn json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

pub(crate) fn lock_recent(
    recent: &Mutex<VecDeque<AttendanceNotice>>,
) -> MutexGuard<'_, VecDeque<AttendanceNotice>> {
    match recent.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Start a session for a class. `config_json` may override session
    /// knobs; an empty string keeps the defaults. Returns the session
    /// as JSON.
    async fn start_session(
        &self,
        class_id: &str,
        teacher: &str,
        mode: &str,
        config_json: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(class_id, teacher, mode, "start_session requested");
        let mode = SessionMode::parse(mode).map_err(|e| invalid(e.to_string()))?;

        let mut config = Config::default_session_config();
        if !config_json.trim().is_empty() {
            let overrides: SessionOverrides = serde_json::from_str(config_json)
                .map_err(|e| invalid(format!("config: {e}")))?;
            if let Some(v) = overrides.motion_threshold {
                config.motion_threshold = v;
            }
            if let Some(v) = overrides.cooldown_secs {
                config.cooldown_secs = v;
            }
            if let Some(v) = overrides.on_time_limit_mins {
                config.on_time_limit_mins = v;
            }
            if let Some(v) = overrides.max_events_per_hour {
                config.max_events_per_hour = v;
            }
            if let Some(v) = overrides.duration_mins {
                config.duration_mins = v;
            }
        }

        let session = self
            .manager
            .start_session(class_id, teacher, mode, config)
            .await
            .map_err(failed)?;
        json(&session)
    }

    /// End a session and finalize absentees. Returns the summary as
    /// JSON; ending an already closed session reports its stored state.
    async fn end_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, "end_session requested");
        let summary = self.manager.end_session(session_id).await.map_err(failed)?;
        json(&summary)
    }

    /// Abort a session. Recorded attendance is kept.
    async fn cancel_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, "cancel_session requested");
        let summary = self
            .manager
            .cancel_session(session_id)
            .await
            .map_err(failed)?;
        json(&summary)
    }

    /// Capture a frame immediately, bypassing motion gating. Returns
    /// the gate outcome string.
    async fn manual_capture(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, "manual_capture requested");
        let outcome = self
            .manager
            .manual_capture(session_id)
            .await
            .map_err(failed)?;
        Ok(outcome.as_str().to_string())
    }

    /// Record a student by hand. Returns false if already recorded.
    async fn manual_check_in(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(session_id, student_id, "manual_check_in requested");
        self.manager
            .manual_check_in(session_id, student_id)
            .await
            .map_err(failed)
    }

    /// Replace a class roster. `roster_json` is an array of
    /// `{student_id, display_name}` objects. Returns the entry count.
    async fn set_roster(&self, class_id: &str, roster_json: &str) -> zbus::fdo::Result<u32> {
        let entries: Vec<RosterEntry> =
            serde_json::from_str(roster_json).map_err(|e| invalid(format!("roster: {e}")))?;
        tracing::info!(class_id, count = entries.len(), "set_roster requested");
        let count = self
            .manager
            .set_roster(class_id, entries)
            .await
            .map_err(failed)?;
        Ok(count as u32)
    }

    /// Return daemon status and every active session as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let sessions = self.manager.status().await.map_err(failed)?;
        json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "active_sessions": sessions,
        }))
    }

    /// Most recent attendance notices, oldest first, as JSON.
    async fn recent_notices(&self) -> zbus::fdo::Result<String> {
        let notices: Vec<AttendanceNotice> =
            lock_recent(&self.recent).iter().cloned().collect();
        json(&notices)
    }
}
