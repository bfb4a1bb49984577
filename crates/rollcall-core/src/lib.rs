//! Decision logic of the attendance pipeline.
//!
//! Motion estimation between consecutive frames, capture gating
//! (cooldown, rate limit, in-flight dedup), and the reconciliation
//! rules that turn recognition matches into attendance statuses.
//! Everything here is pure state + arithmetic; I/O lives in the
//! daemon and store crates.

pub mod gate;
pub mod motion;
pub mod reconcile;
pub mod types;

pub use gate::{CaptureGate, GateDecision};
pub use motion::MotionEstimator;
pub use types::{
    AttendanceStatus, CaptureOutcome, CaptureTrigger, DetectionMethod, RecognitionReply,
    RosterEntry, Session, SessionConfig, SessionMode, SessionStatus, StudentMatch,
};
