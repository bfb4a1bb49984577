//! Per-session frame sampling, gating, and capture dispatch.
//!
//! The capture loop owns the camera. It ticks at the sampling cadence,
//! feeds frames through the motion estimator and the gate, and spawns a
//! dispatch task for each admitted capture. Dispatch is fire-and-continue;
//! the gate's in-flight flag keeps at most one dispatch outstanding per
//! session, and an RAII guard releases it no matter how the dispatch ends.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use rollcall_core::reconcile::{accepted_matches, status_for_check_in};
use rollcall_core::{
    CaptureGate, CaptureOutcome, CaptureTrigger, GateDecision, MotionEstimator, Session,
    SessionMode,
};
use rollcall_hw::{CameraError, Frame, FrameSource};
use rollcall_store::{Database, NewAttendance, NewCapture};

use crate::recognizer::RecognitionClient;
use crate::session::SessionCounters;

/// Lock the gate even if a panicking holder poisoned it; the gate holds
/// nothing but flags and instants, so the state stays usable.
pub(crate) fn lock_gate(gate: &Mutex<CaptureGate>) -> MutexGuard<'_, CaptureGate> {
    match gate.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Releases the in-flight flag when the dispatch task exits, on success,
/// failure, or panic alike.
struct InFlightGuard {
    gate: Arc<Mutex<CaptureGate>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_gate(&self.gate).release();
    }
}

/// A teacher-initiated capture, forwarded into the loop that owns the
/// camera. The reply reports the gate outcome, or a camera error if the
/// frame grab itself failed.
pub(crate) struct ManualCapture {
    pub reply: oneshot::Sender<Result<CaptureOutcome, CameraError>>,
}

/// Everything a capture loop needs besides the camera.
pub(crate) struct CaptureContext {
    pub session: Session,
    pub db: Database,
    pub recognizer: RecognitionClient,
    pub gate: Arc<Mutex<CaptureGate>>,
    pub counters: Arc<SessionCounters>,
    pub accept_threshold: f32,
    pub cancel: CancellationToken,
}

pub(crate) async fn run_capture_loop<S: FrameSource>(
    ctx: CaptureContext,
    mut source: S,
    sample_interval: Duration,
    mut manual_rx: mpsc::Receiver<ManualCapture>,
) {
    let trigger = match ctx.session.mode {
        SessionMode::ContinuousStream => CaptureTrigger::Stream,
        _ => CaptureTrigger::Motion,
    };
    let mut estimator = MotionEstimator::new(source.width(), source.height());
    let mut ticker = interval(sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                sample_tick(&ctx, &mut source, &mut estimator, trigger).await;
            }
            Some(request) = manual_rx.recv() => {
                manual_tick(&ctx, &mut source, request).await;
            }
        }
    }
    // Dropping the source here releases the camera on every exit path.
    tracing::debug!(session = %ctx.session.id, "capture loop stopped");
}

async fn sample_tick<S: FrameSource>(
    ctx: &CaptureContext,
    source: &mut S,
    estimator: &mut MotionEstimator,
    trigger: CaptureTrigger,
) {
    let frame = match source.next_frame() {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(session = %ctx.session.id, error = %err, "frame capture failed");
            return;
        }
    };
    ctx.counters.frames_sampled.fetch_add(1, Ordering::Relaxed);

    let strength = match estimator.observe(&frame.data) {
        Ok(strength) => strength,
        Err(err) => {
            tracing::warn!(session = %ctx.session.id, error = %err, "motion estimation failed");
            return;
        }
    };
    if strength.is_some_and(|s| s >= ctx.session.config.motion_threshold) {
        ctx.counters.motion_events.fetch_add(1, Ordering::Relaxed);
    }

    let decision =
        lock_gate(&ctx.gate).evaluate(trigger, strength, &ctx.session.config, Instant::now());
    match decision {
        GateDecision::Skip => {}
        GateDecision::Blocked(outcome) => {
            record_blocked(ctx, strength.unwrap_or(0.0), trigger, outcome).await;
        }
        GateDecision::Admit => {
            admit(ctx, frame, strength.unwrap_or(0.0), trigger).await;
        }
    }
}

async fn manual_tick<S: FrameSource>(ctx: &CaptureContext, source: &mut S, request: ManualCapture) {
    let decision = lock_gate(&ctx.gate).evaluate(
        CaptureTrigger::Manual,
        None,
        &ctx.session.config,
        Instant::now(),
    );

    let result = match decision {
        GateDecision::Admit => match source.next_frame() {
            Ok(frame) => {
                admit(ctx, frame, 0.0, CaptureTrigger::Manual).await;
                Ok(CaptureOutcome::Admitted)
            }
            Err(err) => {
                // Nothing was dispatched, so the admit must be unwound.
                lock_gate(&ctx.gate).release();
                tracing::warn!(session = %ctx.session.id, error = %err, "manual frame capture failed");
                Err(err)
            }
        },
        GateDecision::Blocked(outcome) => {
            record_blocked(ctx, 0.0, CaptureTrigger::Manual, outcome).await;
            Ok(outcome)
        }
        // Manual triggers never skip; the gate only skips on motion strength.
        GateDecision::Skip => Ok(CaptureOutcome::BlockedDuplicateTrigger),
    };

    if request.reply.send(result).is_err() {
        tracing::debug!(session = %ctx.session.id, "manual capture requester gone");
    }
}

async fn record_blocked(
    ctx: &CaptureContext,
    strength: f32,
    trigger: CaptureTrigger,
    outcome: CaptureOutcome,
) {
    tracing::debug!(
        session = %ctx.session.id,
        strength,
        outcome = outcome.as_str(),
        "capture blocked"
    );
    let result = ctx
        .db
        .record_capture(NewCapture {
            session_id: ctx.session.id.clone(),
            captured_at: Utc::now(),
            motion_strength: strength,
            trigger,
            outcome,
        })
        .await;
    if let Err(err) = result {
        tracing::warn!(session = %ctx.session.id, error = %err, "failed to log blocked capture");
    }
}

/// Record the admitted capture and hand the frame off to a dispatch
/// task. The loop keeps sampling while the dispatch runs.
async fn admit(ctx: &CaptureContext, frame: Frame, strength: f32, trigger: CaptureTrigger) {
    let guard = InFlightGuard {
        gate: Arc::clone(&ctx.gate),
    };
    let captured_at = Utc::now();

    let capture_id = match ctx
        .db
        .record_capture(NewCapture {
            session_id: ctx.session.id.clone(),
            captured_at,
            motion_strength: strength,
            trigger,
            outcome: CaptureOutcome::Admitted,
        })
        .await
    {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(session = %ctx.session.id, error = %err, "failed to log capture");
            return;
        }
    };
    ctx.counters.captures_admitted.fetch_add(1, Ordering::Relaxed);
    tracing::info!(
        session = %ctx.session.id,
        capture = capture_id,
        strength,
        trigger = trigger.as_str(),
        "capture admitted"
    );

    tokio::spawn(dispatch(
        DispatchContext {
            session: ctx.session.clone(),
            db: ctx.db.clone(),
            recognizer: ctx.recognizer.clone(),
            accept_threshold: ctx.accept_threshold,
            cancel: ctx.cancel.clone(),
        },
        frame,
        capture_id,
        captured_at,
        strength,
        trigger,
        guard,
    ));
}

struct DispatchContext {
    session: Session,
    db: Database,
    recognizer: RecognitionClient,
    accept_threshold: f32,
    cancel: CancellationToken,
}

async fn dispatch(
    ctx: DispatchContext,
    frame: Frame,
    capture_id: i64,
    captured_at: DateTime<Utc>,
    strength: f32,
    trigger: CaptureTrigger,
    guard: InFlightGuard,
) {
    // Held for the whole dispatch; dropping it releases the gate.
    let _guard = guard;

    let png = match frame.encode_png() {
        Ok(png) => png,
        Err(err) => {
            complete(&ctx.db, capture_id, None, None, Some(err.to_string())).await;
            return;
        }
    };

    let reply = match ctx
        .recognizer
        .recognize(&ctx.session.id, captured_at, strength, png)
        .await
    {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!(
                session = %ctx.session.id,
                capture = capture_id,
                error = %err,
                "recognition dispatch failed"
            );
            complete(&ctx.db, capture_id, None, None, Some(err.to_string())).await;
            return;
        }
    };

    // The session may have ended while the request was in flight; a
    // stale completion must not write attendance for a finalized session.
    if ctx.cancel.is_cancelled() {
        tracing::debug!(
            session = %ctx.session.id,
            capture = capture_id,
            "session ended before recognition reply; dropping result"
        );
        return;
    }

    let accepted = accepted_matches(&reply.matches, ctx.accept_threshold);
    for candidate in &accepted {
        let status = status_for_check_in(
            ctx.session.started_at,
            captured_at,
            ctx.session.config.on_time_limit_mins,
        );
        let inserted = ctx
            .db
            .insert_attendance(NewAttendance {
                session_id: ctx.session.id.clone(),
                student_id: candidate.student_id.clone(),
                checked_in_at: captured_at,
                status,
                method: Some(trigger.method()),
                confidence: candidate.confidence,
            })
            .await;
        match inserted {
            Ok(true) => {
                tracing::info!(
                    session = %ctx.session.id,
                    student = %candidate.student_id,
                    status = status.as_str(),
                    confidence = candidate.confidence,
                    "attendance recorded"
                );
            }
            Ok(false) => {
                tracing::debug!(
                    session = %ctx.session.id,
                    student = %candidate.student_id,
                    "student already recorded"
                );
            }
            Err(err) => {
                tracing::warn!(
                    session = %ctx.session.id,
                    student = %candidate.student_id,
                    error = %err,
                    "attendance insert failed"
                );
            }
        }
    }

    complete(
        &ctx.db,
        capture_id,
        Some(reply.faces_detected),
        Some(accepted.len() as u32),
        None,
    )
    .await;
}

async fn complete(
    db: &Database,
    capture_id: i64,
    faces: Option<u32>,
    matches: Option<u32>,
    error: Option<String>,
) {
    if let Err(err) = db.complete_capture(capture_id, faces, matches, error).await {
        tracing::warn!(capture = capture_id, error = %err, "failed to complete capture event");
    }
}
