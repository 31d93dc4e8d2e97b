//! Deterministic synthetic frames.
//!
//! When a camera refuses to connect the session degrades to these
//! generators, so every sequence kind stays runnable headless. The star
//! field is fixed by `field_seed` (same stars every exposure); photon and
//! read noise are drawn from `noise_seed`, which callers advance per frame.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};

/// One synthetic star per this many pixels in a full star field.
const PIXELS_PER_STAR: usize = 10_000;
/// PSF width of field stars, pixels.
const FIELD_PSF_SIGMA: f64 = 4.0;
/// PSF width of the single guide star, pixels.
const GUIDE_PSF_SIGMA: f64 = 2.0;
/// PSF patch half width; the patch is (2 * HALF + 1) pixels square.
const PSF_PATCH_HALF: i64 = 11;
/// Mean star flux in counts for a one second exposure.
const STAR_FLUX_RATE: f64 = 10_000.0;
/// Mean sky level in counts per pixel for a one second exposure.
const SKY_RATE: f64 = 1_000.0;
/// Detector bias level in counts.
const BIAS_LEVEL: f64 = 800.0;
/// Gaussian read noise in counts RMS.
const READ_NOISE: f64 = 20.0;

/// Which synthetic scene a fallback session renders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SynthScene {
    /// Many stars over a vignetted sky, like a main imaging camera.
    StarField,
    /// A single star, for guide cameras. Position in pixel coordinates;
    /// `None` centres it.
    GuideStar { centre: Option<(f64, f64)> },
}

/// Render a synthetic exposure.
///
/// A zero second exposure carries no signal and comes out as bias plus
/// read noise, which is exactly what the bias sequences stack.
pub fn render(
    scene: SynthScene,
    shape: (usize, usize),
    exptime_s: f64,
    field_seed: u64,
    noise_seed: u64,
) -> Array2<u16> {
    let expectation = match scene {
        SynthScene::StarField => star_field_expectation(shape, exptime_s, field_seed),
        SynthScene::GuideStar { centre } => {
            let (height, width) = shape;
            let (cx, cy) = centre.unwrap_or(((width as f64 - 1.0) / 2.0, (height as f64 - 1.0) / 2.0));
            guide_star_expectation(shape, exptime_s, (cx, cy), noise_seed)
        }
    };
    sample_detector(&expectation, noise_seed)
}

/// Expected signal (before photon sampling) of the star field: vignetted
/// sky plus Gaussian star profiles at seed-fixed positions.
fn star_field_expectation(shape: (usize, usize), exptime_s: f64, field_seed: u64) -> Array2<f64> {
    let (height, width) = shape;
    let sky = SKY_RATE * exptime_s;
    let mut expectation = Array2::from_shape_fn(shape, |(_, col)| {
        // Linear vignetting gradient across columns.
        sky * (col as f64 / (2.0 * height as f64) + 0.75)
    });

    let mut field_rng = StdRng::seed_from_u64(field_seed);
    let n_stars = ((height * width) / PIXELS_PER_STAR).max(1);
    let flux = STAR_FLUX_RATE * exptime_s;
    for _ in 0..n_stars {
        let row = field_rng.gen_range(0..height);
        let col = field_rng.gen_range(0..width);
        add_star(
            &mut expectation,
            (col as f64, row as f64),
            flux,
            FIELD_PSF_SIGMA,
        );
    }
    expectation
}

/// Expected signal of a single guide star over a flat bias-only
/// background. The star's mean flux is Poisson-perturbed per frame so
/// repeated guide frames vary like real ones.
fn guide_star_expectation(
    shape: (usize, usize),
    exptime_s: f64,
    centre: (f64, f64),
    noise_seed: u64,
) -> Array2<f64> {
    let mut expectation = Array2::zeros(shape);
    let mean_flux = STAR_FLUX_RATE * exptime_s;
    let flux = if mean_flux > 0.0 {
        let mut rng = StdRng::seed_from_u64(noise_seed.wrapping_add(0x5747)); // star flux stream
        Poisson::new(mean_flux)
            .map(|p| p.sample(&mut rng))
            .unwrap_or(mean_flux)
    } else {
        0.0
    };
    add_star(&mut expectation, centre, flux, GUIDE_PSF_SIGMA);
    expectation
}

/// Add one Gaussian star of total `flux` at `(cx, cy)`.
fn add_star(expectation: &mut Array2<f64>, centre: (f64, f64), flux: f64, sigma: f64) {
    if flux <= 0.0 {
        return;
    }
    let (height, width) = expectation.dim();
    let (cx, cy) = centre;
    let peak = flux / (2.0 * std::f64::consts::PI * sigma * sigma);
    let row_centre = cy.round() as i64;
    let col_centre = cx.round() as i64;
    for drow in -PSF_PATCH_HALF..=PSF_PATCH_HALF {
        for dcol in -PSF_PATCH_HALF..=PSF_PATCH_HALF {
            let row = row_centre + drow;
            let col = col_centre + dcol;
            if row < 0 || col < 0 || row >= height as i64 || col >= width as i64 {
                continue;
            }
            let dx = col as f64 - cx;
            let dy = row as f64 - cy;
            let value = peak * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            expectation[[row as usize, col as usize]] += value;
        }
    }
}

/// Poisson-sample photon arrival, add bias and Gaussian read noise, clamp
/// to the 16-bit range.
fn sample_detector(expectation: &Array2<f64>, noise_seed: u64) -> Array2<u16> {
    let mut rng = StdRng::seed_from_u64(noise_seed);
    let read_noise =
        Normal::new(0.0, READ_NOISE).expect("read noise sigma is a positive constant");
    expectation.mapv(|lambda| {
        let photons = if lambda > 0.0 {
            Poisson::new(lambda)
                .map(|p| p.sample(&mut rng))
                .unwrap_or(lambda)
        } else {
            0.0
        };
        let counts = photons + BIAS_LEVEL + read_noise.sample(&mut rng);
        counts.round().clamp(0.0, f64::from(u16::MAX)) as u16
    })
}
