//! Common types and pixel math for the imaging rig.
//!
//! Everything here is single-threaded and side-effect free apart from the
//! FITS frame store. Device driver contracts live in [`drivers`]; the
//! concurrent machinery that exercises them lives in the `sequencer` crate.

pub mod calibrate;
pub mod drivers;
pub mod frame;
pub mod frame_store;
pub mod image_proc;

pub use frame::{CapturedFrame, ExposureRequest, FrameHeader, SequenceKind};
