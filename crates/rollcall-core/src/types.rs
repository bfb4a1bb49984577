use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a session drives its captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// No automatic sampling; the teacher triggers captures by hand.
    Standard,
    /// Frames are sampled on a cadence and captured when motion clears the gate.
    MotionTriggered,
    /// Every sampling tick attempts a capture, subject to cooldown and rate limit.
    ContinuousStream,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Standard => "standard",
            SessionMode::MotionTriggered => "motion-triggered",
            SessionMode::ContinuousStream => "continuous-stream",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "standard" => Ok(SessionMode::Standard),
            "motion-triggered" | "motion" => Ok(SessionMode::MotionTriggered),
            "continuous-stream" | "continuous" => Ok(SessionMode::ContinuousStream),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }

    /// Whether this mode needs a camera for the session's lifetime.
    pub fn needs_camera(&self) -> bool {
        !matches!(self, SessionMode::Standard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(ConfigError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(ConfigError::UnknownStatus(other.to_string())),
        }
    }
}

/// How an attendance record came to exist. Finalization `absent` rows
/// carry no method at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Motion,
    Manual,
    Stream,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Motion => "motion",
            DetectionMethod::Manual => "manual",
            DetectionMethod::Stream => "stream",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "motion" => Ok(DetectionMethod::Motion),
            "manual" => Ok(DetectionMethod::Manual),
            "stream" => Ok(DetectionMethod::Stream),
            other => Err(ConfigError::UnknownStatus(other.to_string())),
        }
    }
}

/// What provoked a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureTrigger {
    Motion,
    Manual,
    Stream,
}

impl CaptureTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureTrigger::Motion => "motion",
            CaptureTrigger::Manual => "manual",
            CaptureTrigger::Stream => "stream",
        }
    }

    pub fn method(&self) -> DetectionMethod {
        match self {
            CaptureTrigger::Motion => DetectionMethod::Motion,
            CaptureTrigger::Manual => DetectionMethod::Manual,
            CaptureTrigger::Stream => DetectionMethod::Stream,
        }
    }
}

/// Terminal outcome of a capture attempt. Sub-threshold motion never
/// produces an event, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureOutcome {
    Admitted,
    BlockedCooldown,
    BlockedRateLimit,
    BlockedDuplicateTrigger,
}

impl CaptureOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureOutcome::Admitted => "admitted",
            CaptureOutcome::BlockedCooldown => "blocked-cooldown",
            CaptureOutcome::BlockedRateLimit => "blocked-rate-limit",
            CaptureOutcome::BlockedDuplicateTrigger => "blocked-duplicate-trigger",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "admitted" => Ok(CaptureOutcome::Admitted),
            "blocked-cooldown" => Ok(CaptureOutcome::BlockedCooldown),
            "blocked-rate-limit" => Ok(CaptureOutcome::BlockedRateLimit),
            "blocked-duplicate-trigger" => Ok(CaptureOutcome::BlockedDuplicateTrigger),
            other => Err(ConfigError::UnknownStatus(other.to_string())),
        }
    }
}

/// Per-session capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Minimum motion strength that counts as an attempt, in (0, 1].
    pub motion_threshold: f32,
    /// Minimum gap between two admitted captures.
    pub cooldown_secs: u64,
    /// Check-ins within this window of session start are `present`, after it `late`.
    pub on_time_limit_mins: u64,
    /// Rolling 60-minute cap on admitted captures.
    pub max_events_per_hour: u32,
    /// Session auto-expires this long after start.
    pub duration_mins: u64,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.motion_threshold > 0.0 && self.motion_threshold <= 1.0) {
            return Err(ConfigError::MotionThresholdOutOfRange(self.motion_threshold));
        }
        if self.duration_mins == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        Ok(())
    }
}

/// An attendance session for one class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub class_id: String,
    pub teacher: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: SessionConfig,
}

impl Session {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::minutes(self.config.duration_mins as i64)
    }
}

/// One enrolled student, snapshotted at session start. Field names
/// match the roster file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub student_id: String,
    pub display_name: String,
}

/// A recognized student with match confidence, as returned by the
/// recognition service. Field names follow the service's snake_case
/// wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentMatch {
    pub student_id: String,
    pub confidence: f32,
}

/// Response body of the recognition service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionReply {
    pub faces_detected: u32,
    #[serde(default)]
    pub matches: Vec<StudentMatch>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("motion threshold {0} out of range (0, 1]")]
    MotionThresholdOutOfRange(f32),
    #[error("session duration must be non-zero")]
    ZeroDuration,
    #[error("unknown session mode: {0}")]
    UnknownMode(String),
    #[error("unknown status value: {0}")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: f32) -> SessionConfig {
        SessionConfig {
            motion_threshold: threshold,
            cooldown_secs: 30,
            on_time_limit_mins: 15,
            max_events_per_hour: 120,
            duration_mins: 120,
        }
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(config(0.1).validate().is_ok());
        assert!(config(1.0).validate().is_ok());
        assert!(config(0.0).validate().is_err());
        assert!(config(1.01).validate().is_err());
        assert!(config(-0.2).validate().is_err());
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut cfg = config(0.1);
        cfg.duration_mins = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            SessionMode::Standard,
            SessionMode::MotionTriggered,
            SessionMode::ContinuousStream,
        ] {
            assert_eq!(SessionMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(SessionMode::parse("nonsense").is_err());
    }

    #[test]
    fn test_mode_short_aliases() {
        assert_eq!(
            SessionMode::parse("motion").unwrap(),
            SessionMode::MotionTriggered
        );
        assert_eq!(
            SessionMode::parse("continuous").unwrap(),
            SessionMode::ContinuousStream
        );
    }

    #[test]
    fn test_recognition_reply_uses_service_field_names() {
        let reply: RecognitionReply = serde_json::from_str(
            r#"{"faces_detected":1,"matches":[{"student_id":"s1","confidence":0.95}]}"#,
        )
        .unwrap();
        assert_eq!(reply.faces_detected, 1);
        assert_eq!(reply.matches[0].student_id, "s1");
    }

    #[test]
    fn test_roster_entry_uses_file_field_names() {
        let entries: Vec<RosterEntry> =
            serde_json::from_str(r#"[{"student_id":"s1","display_name":"Ada"}]"#).unwrap();
        assert_eq!(entries[0].student_id, "s1");
        assert_eq!(entries[0].display_name, "Ada");
    }

    #[test]
    fn test_expires_at() {
        let started = Utc::now();
        let session = Session {
            id: "s1".into(),
            class_id: "c1".into(),
            teacher: "t@example.edu".into(),
            mode: SessionMode::MotionTriggered,
            status: SessionStatus::Active,
            started_at: started,
            ended_at: None,
            config: config(0.1),
        };
        assert_eq!(session.expires_at(), started + chrono::Duration::minutes(120));
    }
}
