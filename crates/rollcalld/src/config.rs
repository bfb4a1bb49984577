use std::path::PathBuf;

use rollcall_core::SessionConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Recognition service endpoint receiving multipart frame uploads.
    pub recognizer_url: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Minimum match confidence the reconciler accepts.
    pub accept_threshold: f32,
    /// Milliseconds between frame samples in an automatic session.
    pub sample_interval_ms: u64,
    /// Milliseconds between notifier polls of the attendance table.
    pub poll_interval_ms: u64,
    /// Timeout in seconds for one recognition request.
    pub recognize_timeout_secs: u64,
    /// How many notices are retained for the recent-notices query.
    pub recent_notices: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            recognizer_url: std::env::var("ROLLCALL_RECOGNIZER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000/recognize".to_string()),
            db_path,
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            accept_threshold: env_f32("ROLLCALL_ACCEPT_THRESHOLD", 0.60),
            sample_interval_ms: env_u64("ROLLCALL_SAMPLE_INTERVAL_MS", 1000),
            poll_interval_ms: env_u64("ROLLCALL_POLL_INTERVAL_MS", 2000),
            recognize_timeout_secs: env_u64("ROLLCALL_RECOGNIZE_TIMEOUT_SECS", 10),
            recent_notices: env_usize("ROLLCALL_RECENT_NOTICES", 64),
        }
    }

    /// Session knobs applied where a start request leaves them unset.
    pub fn default_session_config() -> SessionConfig {
        SessionConfig {
            motion_threshold: 0.1,
            cooldown_secs: 30,
            on_time_limit_mins: 30,
            max_events_per_hour: 120,
            duration_mins: 120,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
