//! Pixel-level building blocks for the acquisition and guiding paths.
//!
//! # Module Organization
//!
//! - **stats**: medians over frames and stacks, including the subsampled
//!   median used to normalize large flats quickly
//! - **centroid**: marginal-projection weighted centroiding for guide stars
//! - **synth**: deterministic synthetic frames for headless operation and
//!   tests
//!
//! All functions take `ndarray` views, allocate only their outputs, and are
//! safe to call from any thread.

pub mod centroid;
pub mod stats;
pub mod synth;

pub use centroid::{locate_star, patch_centroid};
pub use stats::{frame_median, stack_median, subsampled_median, StackError};
