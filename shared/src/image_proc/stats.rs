//! Median statistics over frames and frame stacks.
//!
//! Master calibration frames are per-pixel medians across a stack, so the
//! median shows up in three flavours here: whole-frame (flat-search
//! probes), subsampled (per-frame flat normalization, where a full-frame
//! sort on a multi-megapixel array is too slow), and per-pixel across a
//! stack (master building, parallelized with rayon).

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

/// Errors from stack statistics.
#[derive(Error, Debug)]
pub enum StackError {
    /// No frames supplied.
    #[error("empty frame stack")]
    EmptyStack,

    /// A frame's shape differs from the first frame's.
    #[error("frame shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// Median of a mutable slice. Averages the two middle values for even
/// lengths, matching the usual numeric-library convention.
pub(crate) fn median_in_place(values: &mut [f64]) -> f64 {
    debug_assert!(!values.is_empty());
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Median over every pixel of a frame.
pub fn frame_median(frame: &ArrayView2<f64>) -> f64 {
    let mut values: Vec<f64> = frame.iter().copied().collect();
    if values.is_empty() {
        return 0.0;
    }
    median_in_place(&mut values)
}

/// Median over `n_samples` pixels drawn with replacement from `frame`,
/// using a seeded generator so results are reproducible.
///
/// Used to normalize flat frames before combination: on large sensors the
/// subsample is statistically indistinguishable from the full median and
/// an order of magnitude cheaper.
pub fn subsampled_median(frame: &ArrayView2<f64>, n_samples: usize, seed: u64) -> f64 {
    let flat: Vec<f64> = frame.iter().copied().collect();
    if flat.is_empty() || n_samples == 0 {
        return 0.0;
    }
    if n_samples >= flat.len() {
        let mut all = flat;
        return median_in_place(&mut all);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples: Vec<f64> = (0..n_samples)
        .map(|_| flat[rng.gen_range(0..flat.len())])
        .collect();
    median_in_place(&mut samples)
}

/// Per-pixel median across a stack of equally shaped frames.
///
/// Rows are processed in parallel; each output pixel is the median of that
/// pixel's values across the stack. A single outlier frame cannot shift
/// the result, which is the whole point of median stacking.
pub fn stack_median(frames: &[Array2<f64>]) -> Result<Array2<f64>, StackError> {
    let first = frames.first().ok_or(StackError::EmptyStack)?;
    let shape = first.dim();
    for frame in frames {
        if frame.dim() != shape {
            return Err(StackError::ShapeMismatch {
                expected: shape,
                got: frame.dim(),
            });
        }
    }

    let (height, width) = shape;
    let rows: Vec<Vec<f64>> = (0..height)
        .into_par_iter()
        .map(|row| {
            let mut column = vec![0.0; frames.len()];
            (0..width)
                .map(|col| {
                    for (k, frame) in frames.iter().enumerate() {
                        column[k] = frame[[row, col]];
                    }
                    median_in_place(&mut column)
                })
                .collect()
        })
        .collect();

    let mut out = Array2::zeros(shape);
    for (row, values) in rows.into_iter().enumerate() {
        for (col, value) in values.into_iter().enumerate() {
            out[[row, col]] = value;
        }
    }
    Ok(out)
}
