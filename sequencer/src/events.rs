//! Operator-facing event stream.

use std::path::PathBuf;

use shared::SequenceKind;

use crate::workflow::WorkflowOutcome;

/// One entry in the event stream the controller emits. Everything an
/// operator console needs to mirror rig activity arrives here.
#[derive(Debug, Clone)]
pub enum RigEvent {
    /// A frame was captured; `path` is set when the frame was stored.
    FrameReady {
        kind: SequenceKind,
        index: usize,
        simulated: bool,
        path: Option<PathBuf>,
    },

    /// Operator-readable log line, mirrored to the logger.
    LogLine(String),

    /// The active workflow finished, successfully or not.
    WorkflowDone {
        kind: SequenceKind,
        outcome: WorkflowOutcome,
    },

    /// An asynchronous plate solution arrived.
    SolutionReady { ra_deg: f64, dec_deg: f64 },
}
