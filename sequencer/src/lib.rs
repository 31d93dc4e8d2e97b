//! Acquisition and guiding core for the imaging rig.
//!
//! Three threads of control: a [`session::CameraSession`] background
//! thread per camera, the [`guiding::GuideLoop`] actuator thread, and
//! the single-threaded [`controller::RigController`], which pumps events
//! and advances the resumable [`workflow::AcquisitionWorkflow`] state
//! machine one step per delivered frame.

pub mod calibrator;
pub mod config;
pub mod controller;
pub mod events;
pub mod guiding;
pub mod session;
pub mod solver;
pub mod workflow;

// Re-export the types operators interact with.
pub use crate::config::RigConfig;
pub use crate::controller::{ControllerError, RigController, RigDrivers};
pub use crate::events::RigEvent;
pub use crate::workflow::{SequenceParams, WorkflowOutcome, WorkflowState};
