//! Motion strength between consecutive grayscale frames.
//!
//! Both frames are downsampled to a small fixed grid before comparison,
//! trading spatial fidelity for throughput; the accumulated per-pixel
//! luminance delta is normalized to [0, 1].

use thiserror::Error;

/// Downsample target. Frames smaller than this are sampled at their
/// native resolution.
const SAMPLE_WIDTH: u32 = 160;
const SAMPLE_HEIGHT: u32 = 120;
const MAX_LUMA: f32 = 255.0;

#[derive(Error, Debug)]
pub enum MotionError {
    #[error("frame length mismatch: expected {expected} bytes for {width}x{height}, got {actual}")]
    InvalidLength {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },
}

/// Normalized difference score between two grayscale frames of equal
/// dimensions. Identical frames score exactly 0. Fails when either
/// frame is shorter than the stated dimensions require.
pub fn motion_strength(
    prev: &[u8],
    cur: &[u8],
    width: u32,
    height: u32,
) -> Result<f32, MotionError> {
    if width == 0 || height == 0 {
        return Ok(0.0);
    }
    let expected = (width * height) as usize;
    let actual = prev.len().min(cur.len());
    if actual < expected {
        return Err(MotionError::InvalidLength {
            expected,
            actual,
            width,
            height,
        });
    }

    let sw = width.min(SAMPLE_WIDTH) as usize;
    let sh = height.min(SAMPLE_HEIGHT) as usize;
    let w = width as usize;

    let mut total_delta = 0.0f32;
    for sy in 0..sh {
        let y = sy * height as usize / sh;
        for sx in 0..sw {
            let x = sx * w / sw;
            let idx = y * w + x;
            total_delta += (prev[idx] as f32 - cur[idx] as f32).abs();
        }
    }

    Ok(total_delta / (sw as f32 * sh as f32 * MAX_LUMA))
}

/// Stateful wrapper holding the previous frame.
///
/// The very first observation has nothing to compare against and yields
/// `None`; callers must treat that as "do not trigger", not as zero motion.
pub struct MotionEstimator {
    width: u32,
    height: u32,
    prev: Option<Vec<u8>>,
}

impl MotionEstimator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            prev: None,
        }
    }

    /// Feed the next frame; returns the motion strength against the
    /// previous one, or `None` on the first call.
    pub fn observe(&mut self, frame: &[u8]) -> Result<Option<f32>, MotionError> {
        let expected = (self.width * self.height) as usize;
        if frame.len() < expected {
            return Err(MotionError::InvalidLength {
                expected,
                actual: frame.len(),
                width: self.width,
                height: self.height,
            });
        }

        let strength = self
            .prev
            .as_deref()
            .map(|prev| motion_strength(prev, frame, self.width, self.height))
            .transpose()?;
        self.prev = Some(frame[..expected].to_vec());
        Ok(strength)
    }

    /// Drop the held frame, e.g. after a camera re-open.
    pub fn reset(&mut self) {
        self.prev = None;
    }
}
