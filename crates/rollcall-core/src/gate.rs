//! Decides whether a capture attempt may proceed before
//! any recognition call is spent on it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::types::{CaptureOutcome, CaptureTrigger, SessionConfig};

/// Rolling window for the hourly admission cap. Deliberately not
/// calendar-aligned: a burst at :55 still counts against :05.
const RATE_WINDOW: Duration = Duration::from_secs(3600);

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed with the capture. The in-flight flag is now set and must
    /// be released when the dispatch settles, successfully or not.
    Admit,
    /// Rejected; a blocked capture event should be logged with this outcome.
    Blocked(CaptureOutcome),
    /// Routine noise below the motion threshold, or no prior frame.
    /// No capture event is recorded at all.
    Skip,
}

/// Per-session admission state. Sessions are independent; this is not a
/// lock across sessions.
#[derive(Debug, Default)]
pub struct CaptureGate {
    in_flight: bool,
    last_admitted: Option<Instant>,
    admitted_window: VecDeque<Instant>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one capture attempt. Rules in order, first match wins:
    ///
    /// 1. a capture is already in flight → blocked-duplicate-trigger
    /// 2. motion strength below threshold (or unknown) → skip, no event
    /// 3. cooldown since the last admission has not elapsed → blocked-cooldown
    /// 4. rolling-hour admission cap reached → blocked-rate-limit
    /// 5. admit
    ///
    /// Manual captures bypass rules 2–4; stream captures bypass rule 2.
    pub fn evaluate(
        &mut self,
        trigger: CaptureTrigger,
        strength: Option<f32>,
        config: &SessionConfig,
        now: Instant,
    ) -> GateDecision {
        if self.in_flight {
            return GateDecision::Blocked(CaptureOutcome::BlockedDuplicateTrigger);
        }

        if trigger == CaptureTrigger::Motion {
            match strength {
                Some(s) if s >= config.motion_threshold => {}
                _ => return GateDecision::Skip,
            }
        }

        if trigger != CaptureTrigger::Manual {
            if let Some(last) = self.last_admitted {
                if now.duration_since(last) < Duration::from_secs(config.cooldown_secs) {
                    return GateDecision::Blocked(CaptureOutcome::BlockedCooldown);
                }
            }

            self.prune_window(now);
            if self.admitted_window.len() >= config.max_events_per_hour as usize {
                return GateDecision::Blocked(CaptureOutcome::BlockedRateLimit);
            }
        }

        self.in_flight = true;
        self.last_admitted = Some(now);
        self.admitted_window.push_back(now);
        GateDecision::Admit
    }

    /// Release the in-flight flag. Called whenever a dispatch settles,
    /// so a failed network call cannot wedge the gate.
    pub fn release(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Admissions currently inside the rolling window.
    pub fn admitted_in_window(&mut self, now: Instant) -> usize {
        self.prune_window(now);
        self.admitted_window.len()
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(&front) = self.admitted_window.front() {
            if now.duration_since(front) >= RATE_WINDOW {
                self.admitted_window.pop_front();
            } else {
                break;
            }
        }
    }
}
