//! Calibration transforms and master-frame builders.
//!
//! All functions are pure: they take views, allocate their output, and
//! never touch the stored master. Shape mismatches are errors; a missing
//! master is the caller's concern (the workflow logs a quality warning and
//! proceeds uncorrected).

use ndarray::{s, Array2, ArrayView2};
use thiserror::Error;

use crate::image_proc::stats::{stack_median, subsampled_median, StackError};

/// Pixels drawn for the per-frame flat normalization median.
const FLAT_SUBSAMPLE: usize = 100_000;

#[derive(Error, Debug)]
pub enum CalibrateError {
    /// Frame and master shapes differ.
    #[error("shape mismatch: frame {frame:?} vs master {master:?}")]
    ShapeMismatch {
        frame: (usize, usize),
        master: (usize, usize),
    },

    /// Mosaic dimensions must be even to split 2x2 Bayer cells.
    #[error("mosaic dimensions must be even, got {0:?}")]
    OddMosaic((usize, usize)),

    /// Master dark needs a positive exposure time to become a rate.
    #[error("dark stack exposure time must be positive, got {0}")]
    NonPositiveDarkExposure(f64),

    #[error(transparent)]
    Stack(#[from] StackError),
}

fn check_shapes(
    frame: &ArrayView2<f64>,
    master: &ArrayView2<f64>,
) -> Result<(), CalibrateError> {
    if frame.dim() != master.dim() {
        return Err(CalibrateError::ShapeMismatch {
            frame: frame.dim(),
            master: master.dim(),
        });
    }
    Ok(())
}

/// Subtract the master bias.
pub fn bias_subtract(
    frame: &ArrayView2<f64>,
    master_bias: &ArrayView2<f64>,
) -> Result<Array2<f64>, CalibrateError> {
    check_shapes(frame, master_bias)?;
    Ok(frame - master_bias)
}

/// Subtract a scaled master dark.
///
/// The master is stored as a rate (counts per second); it is scaled by
/// `exptime_s` and clamped to `ceiling` per pixel before subtraction, so
/// already saturated dark pixels are not oversubtracted. A zero exposure
/// subtracts nothing.
pub fn dark_subtract(
    frame: &ArrayView2<f64>,
    dark_rate: &ArrayView2<f64>,
    exptime_s: f64,
    ceiling: f64,
) -> Result<Array2<f64>, CalibrateError> {
    check_shapes(frame, dark_rate)?;
    if exptime_s <= 0.0 {
        return Ok(frame.to_owned());
    }
    let mut out = frame.to_owned();
    out.zip_mut_with(dark_rate, |pixel, &rate| {
        *pixel -= (rate * exptime_s).min(ceiling);
    });
    Ok(out)
}

/// Divide by the master flat. Pixels where the flat is not positive pass
/// through with unit gain rather than exploding.
pub fn flat_divide(
    frame: &ArrayView2<f64>,
    master_flat: &ArrayView2<f64>,
) -> Result<Array2<f64>, CalibrateError> {
    check_shapes(frame, master_flat)?;
    let mut out = frame.to_owned();
    out.zip_mut_with(master_flat, |pixel, &gain| {
        if gain > 0.0 {
            *pixel /= gain;
        }
    });
    Ok(out)
}

/// Colour planes reconstructed from a Bayer mosaic.
#[derive(Debug, Clone)]
pub struct RgbPlanes {
    pub r: Array2<f64>,
    pub g: Array2<f64>,
    pub b: Array2<f64>,
}

/// Split an RGGB mosaic into half-resolution colour planes.
///
/// Cell layout: R at (0,0), G at (0,1) and (1,0), B at (1,1); the two
/// green samples are averaged.
pub fn debayer(mosaic: &ArrayView2<f64>) -> Result<RgbPlanes, CalibrateError> {
    let (height, width) = mosaic.dim();
    if height % 2 != 0 || width % 2 != 0 {
        return Err(CalibrateError::OddMosaic((height, width)));
    }
    let r = mosaic.slice(s![0..;2, 0..;2]).to_owned();
    let g1 = mosaic.slice(s![0..;2, 1..;2]).to_owned();
    let g2 = mosaic.slice(s![1..;2, 0..;2]).to_owned();
    let b = mosaic.slice(s![1..;2, 1..;2]).to_owned();
    let g = (&g1 + &g2) / 2.0;
    Ok(RgbPlanes { r, g, b })
}

/// Full-resolution debayer: each colour plane is bilinearly interpolated
/// from its subgrid of samples, then the greens are averaged.
pub fn debayer_interpolated(mosaic: &ArrayView2<f64>) -> Result<RgbPlanes, CalibrateError> {
    let (height, width) = mosaic.dim();
    if height % 2 != 0 || width % 2 != 0 {
        return Err(CalibrateError::OddMosaic((height, width)));
    }
    let r = bilinear_expand(mosaic, 0, 0);
    let g1 = bilinear_expand(mosaic, 0, 1);
    let g2 = bilinear_expand(mosaic, 1, 0);
    let b = bilinear_expand(mosaic, 1, 1);
    let g = (&g1 + &g2) / 2.0;
    Ok(RgbPlanes { r, g, b })
}

/// Interpolate the subgrid at (row_parity, col_parity) back to full
/// resolution with order-1 (bilinear) interpolation, clamped at the
/// edges.
fn bilinear_expand(mosaic: &ArrayView2<f64>, row_parity: usize, col_parity: usize) -> Array2<f64> {
    let (height, width) = mosaic.dim();
    let sub_rows = height / 2;
    let sub_cols = width / 2;
    let sample = |i: usize, j: usize| mosaic[[2 * i + row_parity, 2 * j + col_parity]];

    Array2::from_shape_fn((height, width), |(row, col)| {
        // Position in subgrid coordinates, clamped to the sampled area.
        let u = ((row as f64 - row_parity as f64) / 2.0).clamp(0.0, (sub_rows - 1) as f64);
        let v = ((col as f64 - col_parity as f64) / 2.0).clamp(0.0, (sub_cols - 1) as f64);
        let i0 = u.floor() as usize;
        let j0 = v.floor() as usize;
        let i1 = (i0 + 1).min(sub_rows - 1);
        let j1 = (j0 + 1).min(sub_cols - 1);
        let fu = u - i0 as f64;
        let fv = v - j0 as f64;
        let top = sample(i0, j0) * (1.0 - fv) + sample(i0, j1) * fv;
        let bottom = sample(i1, j0) * (1.0 - fv) + sample(i1, j1) * fv;
        top * (1.0 - fu) + bottom * fu
    })
}

/// Master bias: per-pixel median of the stack.
pub fn master_bias(stack: &[Array2<f64>]) -> Result<Array2<f64>, CalibrateError> {
    Ok(stack_median(stack)?)
}

/// Master dark rate: per-pixel median of the stack divided by the stack's
/// common exposure time, giving counts per second.
pub fn master_dark_rate(
    stack: &[Array2<f64>],
    exptime_s: f64,
) -> Result<Array2<f64>, CalibrateError> {
    if exptime_s <= 0.0 {
        return Err(CalibrateError::NonPositiveDarkExposure(exptime_s));
    }
    let median = stack_median(stack)?;
    Ok(median / exptime_s)
}

/// Master flat: each frame is first normalized by its subsampled median,
/// then the normalized frames are median combined. The result is a gain
/// map with values near 1.
pub fn master_flat(stack: &[Array2<f64>], seed: u64) -> Result<Array2<f64>, CalibrateError> {
    let normalized: Vec<Array2<f64>> = stack
        .iter()
        .enumerate()
        .map(|(index, frame)| {
            let median = subsampled_median(&frame.view(), FLAT_SUBSAMPLE, seed.wrapping_add(index as u64));
            if median > 0.0 {
                frame / median
            } else {
                frame.clone()
            }
        })
        .collect();
    Ok(stack_median(&normalized)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn bias_subtract_elementwise() {
        let frame = array![[100.0, 200.0], [300.0, 400.0]];
        let bias = array![[10.0, 20.0], [30.0, 40.0]];
        let out = bias_subtract(&frame.view(), &bias.view()).unwrap();
        assert_relative_eq!(out[[0, 0]], 90.0);
        assert_relative_eq!(out[[1, 1]], 360.0);
    }

    #[test]
    fn bias_subtract_shape_mismatch() {
        let frame = Array2::<f64>::zeros((2, 2));
        let bias = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            bias_subtract(&frame.view(), &bias.view()),
            Err(CalibrateError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn dark_subtract_scales_and_clamps() {
        let frame = array![[1000.0, 1000.0]];
        let rate = array![[10.0, 500.0]];
        // 10 s exposure: 100 counts from the quiet pixel, 5000 would come
        // from the hot one but the ceiling holds it at 300.
        let out = dark_subtract(&frame.view(), &rate.view(), 10.0, 300.0).unwrap();
        assert_relative_eq!(out[[0, 0]], 900.0);
        assert_relative_eq!(out[[0, 1]], 700.0);
    }

    #[test]
    fn dark_subtract_zero_exposure_is_noop() {
        let frame = array![[123.0, 456.0]];
        let rate = array![[10.0, 10.0]];
        let out = dark_subtract(&frame.view(), &rate.view(), 0.0, 1000.0).unwrap();
        assert_relative_eq!(out[[0, 0]], 123.0);
        assert_relative_eq!(out[[0, 1]], 456.0);
    }

    #[test]
    fn flat_divide_skips_dead_gain() {
        let frame = array![[100.0, 100.0]];
        let flat = array![[2.0, 0.0]];
        let out = flat_divide(&frame.view(), &flat.view()).unwrap();
        assert_relative_eq!(out[[0, 0]], 50.0);
        assert_relative_eq!(out[[0, 1]], 100.0);
    }

    #[test]
    fn debayer_splits_rggb_cells() {
        let mosaic = array![
            [1.0, 2.0, 5.0, 6.0],
            [3.0, 4.0, 7.0, 8.0],
            [9.0, 10.0, 13.0, 14.0],
            [11.0, 12.0, 15.0, 16.0],
        ];
        let planes = debayer(&mosaic.view()).unwrap();
        assert_eq!(planes.r.dim(), (2, 2));
        assert_relative_eq!(planes.r[[0, 0]], 1.0);
        assert_relative_eq!(planes.r[[0, 1]], 5.0);
        assert_relative_eq!(planes.b[[0, 0]], 4.0);
        // g = (g1 + g2) / 2 = (2 + 3) / 2 for the first cell.
        assert_relative_eq!(planes.g[[0, 0]], 2.5);
    }

    #[test]
    fn debayer_rejects_odd_mosaic() {
        let mosaic = Array2::<f64>::zeros((3, 4));
        assert!(matches!(
            debayer(&mosaic.view()),
            Err(CalibrateError::OddMosaic(_))
        ));
    }

    #[test]
    fn interpolated_debayer_is_exact_on_a_plane() {
        // A mosaic whose red samples lie on the plane v = row + col is
        // reconstructed exactly by bilinear interpolation.
        let mosaic = Array2::from_shape_fn((8, 8), |(row, col)| {
            if row % 2 == 0 && col % 2 == 0 {
                (row + col) as f64
            } else {
                -1000.0
            }
        });
        let planes = debayer_interpolated(&mosaic.view()).unwrap();
        assert_eq!(planes.r.dim(), (8, 8));
        assert_relative_eq!(planes.r[[0, 0]], 0.0);
        assert_relative_eq!(planes.r[[2, 4]], 6.0);
        // Interior interpolated point between samples (2,2)=4 and (2,4)=6.
        assert_relative_eq!(planes.r[[2, 3]], 5.0);
        // Between rows as well: (1,3) averages four surrounding samples.
        assert_relative_eq!(planes.r[[1, 3]], 4.0);
    }

    #[test]
    fn master_dark_rate_divides_by_exposure() {
        let stack = vec![
            Array2::from_elem((2, 2), 50.0),
            Array2::from_elem((2, 2), 60.0),
            Array2::from_elem((2, 2), 70.0),
        ];
        let rate = master_dark_rate(&stack, 10.0).unwrap();
        assert_relative_eq!(rate[[0, 0]], 6.0);
        assert!(master_dark_rate(&stack, 0.0).is_err());
    }

    #[test]
    fn master_flat_is_normalized_gain_map() {
        // Three flats at very different illumination levels but identical
        // structure combine to a gain map near 1.
        let structure = Array2::from_shape_fn((20, 20), |(y, x)| {
            1.0 + 0.1 * ((x as f64) / 20.0) - 0.05 * ((y as f64) / 20.0)
        });
        let stack: Vec<Array2<f64>> = [10_000.0, 20_000.0, 30_000.0]
            .iter()
            .map(|level| &structure * *level)
            .collect();
        let flat = master_flat(&stack, 1).unwrap();
        let centre = flat[[10, 10]];
        assert!((centre - 1.0).abs() < 0.1, "centre gain {centre}");
        // Structure must survive normalization: gradient corner ratio.
        let ratio = flat[[0, 19]] / flat[[19, 0]];
        let expected = structure[[0, 19]] / structure[[19, 0]];
        assert_relative_eq!(ratio, expected, epsilon = 1e-6);
    }
}
