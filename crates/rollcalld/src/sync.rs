//! Attendance change notifications.
//!
//! Each active session gets its own `Notifier` that polls the store and
//! forwards new attendance records to the daemon's notice channel. The
//! watermark follows the row id, i.e. insertion order, so every record
//! is surfaced exactly once even when its check-in timestamp predates
//! rows already seen; each batch goes out in check-in order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use rollcall_core::{AttendanceStatus, DetectionMethod};
use rollcall_store::{Database, StoreError};

/// One attendance change, pushed to the daemon's notice channel.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceNotice {
    pub session_id: String,
    pub class_id: String,
    pub student_id: String,
    pub display_name: Option<String>,
    pub status: AttendanceStatus,
    pub method: Option<DetectionMethod>,
    pub checked_in_at: DateTime<Utc>,
}

/// Per-session poller. No state is shared between sessions.
pub struct Notifier {
    db: Database,
    session_id: String,
    class_id: String,
    watermark: i64,
    sink: mpsc::UnboundedSender<AttendanceNotice>,
}

impl Notifier {
    pub fn new(
        db: Database,
        session_id: String,
        class_id: String,
        sink: mpsc::UnboundedSender<AttendanceNotice>,
    ) -> Self {
        Self {
            db,
            session_id,
            class_id,
            watermark: 0,
            sink,
        }
    }

    /// One poll pass. Returns how many notices went out.
    ///
    /// Records come back ordered by check-in time, so their row ids may
    /// arrive out of order within a batch; the watermark takes the
    /// batch maximum.
    pub async fn poll_once(&mut self) -> Result<usize, StoreError> {
        let records = self
            .db
            .attendance_since(&self.session_id, self.watermark)
            .await?;

        let mut emitted = 0;
        for record in records {
            self.watermark = self.watermark.max(record.id);

            let notice = AttendanceNotice {
                session_id: self.session_id.clone(),
                class_id: self.class_id.clone(),
                student_id: record.student_id,
                display_name: record.display_name,
                status: record.status,
                method: record.method,
                checked_in_at: record.checked_in_at,
            };
            if self.sink.send(notice).is_err() {
                tracing::warn!(session = %self.session_id, "notice consumer gone");
                break;
            }
            emitted += 1;
        }
        Ok(emitted)
    }
}

/// Drive a notifier at the poll cadence until the session's token fires.
///
/// The notifier stays behind a shared mutex so session teardown can run
/// a final drain after finalization has written the absent rows.
pub async fn run_notifier(
    notifier: Arc<Mutex<Notifier>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut notifier = notifier.lock().await;
                if let Err(err) = notifier.poll_once().await {
                    tracing::warn!(
                        session = %notifier.session_id,
                        error = %err,
                        "notifier poll failed"
                    );
                }
            }
        }
    }
}
