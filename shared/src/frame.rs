//! Frame and exposure types shared between the camera sessions, the
//! acquisition workflow, and the frame store.

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a sequence (and each frame in it) is for.
///
/// The label doubles as the `OBJECT` header value and as the frame-name
/// component on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceKind {
    Bias,
    Dark,
    Flat,
    Science,
    Acquisition,
    Continuous,
}

impl SequenceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SequenceKind::Bias => "bias",
            SequenceKind::Dark => "dark",
            SequenceKind::Flat => "flat",
            SequenceKind::Science => "science",
            SequenceKind::Acquisition => "acquisition",
            SequenceKind::Continuous => "continuous",
        }
    }

    /// Whether exposures of this kind open the shutter.
    pub fn is_light(&self) -> bool {
        !matches!(self, SequenceKind::Bias | SequenceKind::Dark)
    }

    /// Calibration kinds are stacked into master frames and carry no
    /// sky position in their headers.
    pub fn is_calibration(&self) -> bool {
        matches!(
            self,
            SequenceKind::Bias | SequenceKind::Dark | SequenceKind::Flat
        )
    }
}

impl fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One exposure to be taken by a camera session. Created per step,
/// consumed once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureRequest {
    /// Exposure duration in seconds, >= 0.
    pub exptime_s: f64,
    /// Open the shutter (false for bias/dark).
    pub is_light: bool,
}

impl ExposureRequest {
    pub fn new(exptime_s: f64, is_light: bool) -> Self {
        Self {
            exptime_s: exptime_s.max(0.0),
            is_light,
        }
    }
}

/// A frame delivered by a camera session.
///
/// `captured_at` is sampled immediately before the driver starts the
/// exposure, never at delivery time. Ownership moves through the session's
/// frame channel to exactly one consumer.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub pixels: Array2<u16>,
    pub captured_at: DateTime<Utc>,
    pub exptime_s: f64,
    /// True when the frame came from the synthetic fallback rather than a
    /// connected device.
    pub simulated: bool,
}

impl CapturedFrame {
    /// (height, width) of the pixel buffer.
    pub fn dimensions(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    /// Pixel buffer widened to f64 for calibration math.
    pub fn pixels_f64(&self) -> Array2<f64> {
        self.pixels.mapv(f64::from)
    }
}

/// Header fields recorded alongside every saved frame.
///
/// `position` is written only for kinds that look at the sky; calibration
/// frames carry none.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub captured_at: DateTime<Utc>,
    pub exptime_s: f64,
    pub kind: SequenceKind,
    /// (RA, Dec) in degrees at capture time, when known.
    pub position: Option<(f64, f64)>,
}

impl FrameHeader {
    pub fn for_frame(frame: &CapturedFrame, kind: SequenceKind) -> Self {
        Self {
            captured_at: frame.captured_at,
            exptime_s: frame.exptime_s,
            kind,
            position: None,
        }
    }

    pub fn with_position(mut self, position: Option<(f64, f64)>) -> Self {
        self.position = if self.kind.is_calibration() {
            None
        } else {
            position
        };
        self
    }
}
