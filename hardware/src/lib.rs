//! Device drivers for the imaging rig.
//!
//! Real hardware lives in [`serial_tilt`]; the simulated rig in [`sim`]
//! implements the same driver traits against the synthetic frame
//! renderer, so the whole control stack runs without any devices
//! attached.

pub mod serial_tilt;
pub mod sim;
