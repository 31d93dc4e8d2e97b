//! Guide-star centroiding via marginal projections.
//!
//! The patch is collapsed to x and y profiles; each profile is
//! min-subtracted and squared to weight the bright core heavily, then the
//! weighted mean position is taken about the profile centre. Two 1-D
//! passes are cheaper than a full 2-D moment sum and plenty for the
//! sub-pixel precision guiding needs.

use nalgebra::Vector2;
use ndarray::{s, ArrayView2, Axis};

/// Weighted centroid of a 1-D profile, as an offset from the profile
/// centre `(n - 1) / 2`.
fn centroid_1d(profile: &[f64]) -> f64 {
    if profile.is_empty() {
        return 0.0;
    }
    let min = profile.iter().copied().fold(f64::INFINITY, f64::min);
    let centre = (profile.len() as f64 - 1.0) / 2.0;
    let mut weight_sum = 0.0;
    let mut position_sum = 0.0;
    for (i, &value) in profile.iter().enumerate() {
        let weight = (value - min).powi(2);
        weight_sum += weight;
        position_sum += weight * (i as f64 - centre);
    }
    if weight_sum > 0.0 {
        position_sum / weight_sum
    } else {
        0.0
    }
}

/// Centroid offset of the brightest feature in `patch`, in pixels from the
/// patch centre. Positive x is rightward (columns), positive y downward
/// (rows).
pub fn patch_centroid(patch: &ArrayView2<f64>) -> Vector2<f64> {
    let x_profile: Vec<f64> = patch.sum_axis(Axis(0)).iter().copied().collect();
    let y_profile: Vec<f64> = patch.sum_axis(Axis(1)).iter().copied().collect();
    Vector2::new(centroid_1d(&x_profile), centroid_1d(&y_profile))
}

/// Locate the brightest star in `frame`: cut a `box_size` patch around the
/// peak pixel (clamped to the frame) and centroid it.
///
/// Returns the star position in frame coordinates (x, y).
pub fn locate_star(frame: &ArrayView2<f64>, box_size: usize) -> Vector2<f64> {
    let (height, width) = frame.dim();
    if height == 0 || width == 0 {
        return Vector2::zeros();
    }

    let mut peak = (0usize, 0usize);
    let mut peak_value = f64::NEG_INFINITY;
    for ((row, col), &value) in frame.indexed_iter() {
        if value > peak_value {
            peak_value = value;
            peak = (row, col);
        }
    }

    let half = box_size / 2;
    let row0 = peak.0.saturating_sub(half);
    let row1 = (peak.0 + half + 1).min(height);
    let col0 = peak.1.saturating_sub(half);
    let col1 = (peak.1 + half + 1).min(width);

    let patch = frame.slice(s![row0..row1, col0..col1]);
    let offset = patch_centroid(&patch);

    let patch_centre_x = col0 as f64 + (patch.ncols() as f64 - 1.0) / 2.0;
    let patch_centre_y = row0 as f64 + (patch.nrows() as f64 - 1.0) / 2.0;
    Vector2::new(patch_centre_x + offset.x, patch_centre_y + offset.y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn gaussian_frame(shape: (usize, usize), cx: f64, cy: f64, sigma: f64) -> Array2<f64> {
        Array2::from_shape_fn(shape, |(y, x)| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            1000.0 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
    }

    #[test]
    fn centred_star_has_zero_offset() {
        let frame = gaussian_frame((25, 25), 12.0, 12.0, 2.0);
        let offset = patch_centroid(&frame.view());
        assert_relative_eq!(offset.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(offset.y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn offset_star_is_measured() {
        let frame = gaussian_frame((25, 25), 14.5, 10.0, 2.0);
        let offset = patch_centroid(&frame.view());
        assert_relative_eq!(offset.x, 2.5, epsilon = 0.05);
        assert_relative_eq!(offset.y, -2.0, epsilon = 0.05);
    }

    #[test]
    fn locate_star_finds_absolute_position() {
        let frame = gaussian_frame((64, 64), 40.25, 21.5, 2.0);
        let position = locate_star(&frame.view(), 25);
        assert_relative_eq!(position.x, 40.25, epsilon = 0.05);
        assert_relative_eq!(position.y, 21.5, epsilon = 0.05);
    }

    #[test]
    fn locate_star_near_edge_stays_in_bounds() {
        let frame = gaussian_frame((64, 64), 2.0, 61.0, 2.0);
        let position = locate_star(&frame.view(), 25);
        assert_relative_eq!(position.x, 2.0, epsilon = 0.25);
        assert_relative_eq!(position.y, 61.0, epsilon = 0.25);
    }

    #[test]
    fn flat_frame_centroids_to_centre() {
        let frame = Array2::from_elem((11, 11), 3.0);
        let offset = patch_centroid(&frame.view());
        assert_relative_eq!(offset.x, 0.0);
        assert_relative_eq!(offset.y, 0.0);
    }
}
