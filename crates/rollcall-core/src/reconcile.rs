//! Reconciliation rules: which matches are accepted and what status a
//! check-in earns. The at-most-one-record invariant itself is enforced
//! by the store's uniqueness constraint; these are the pure rules around it.

use chrono::{DateTime, Duration, Utc};

use crate::types::{AttendanceStatus, StudentMatch};

/// Confidence assigned to manual check-ins.
pub const MANUAL_CONFIDENCE: f32 = 1.0;

/// Status a check-in earns from its timing: `present` within the
/// on-time window (inclusive), `late` after it.
pub fn status_for_check_in(
    started_at: DateTime<Utc>,
    checked_in_at: DateTime<Utc>,
    on_time_limit_mins: u64,
) -> AttendanceStatus {
    let deadline = started_at + Duration::minutes(on_time_limit_mins as i64);
    if checked_in_at <= deadline {
        AttendanceStatus::Present
    } else {
        AttendanceStatus::Late
    }
}

/// Filter a recognition reply down to matches clearing the acceptance
/// threshold. Everything below it is discarded, not recorded.
pub fn accepted_matches(matches: &[StudentMatch], min_confidence: f32) -> Vec<&StudentMatch> {
    matches
        .iter()
        .filter(|m| m.confidence >= min_confidence)
        .collect()
}
