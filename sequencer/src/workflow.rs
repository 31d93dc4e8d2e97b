//! The acquisition workflow state machine.
//!
//! One instance runs one sequence kind. The machine suspends exactly
//! where it waits for a frame and is re-entered by [`AcquisitionWorkflow::resume`]
//! when the camera session delivers one; it never polls the device.
//! Abort is cooperative: [`AcquisitionWorkflow::abort`] flags the
//! machine, the flag is honoured at every suspend and resume boundary
//! and before each exposure request, and final cleanup runs exactly
//! once whether the sequence completes, aborts, or fails.

use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use crossbeam_channel::Sender;
use ndarray::Array2;

use shared::calibrate::{
    bias_subtract, dark_subtract, flat_divide, master_bias, master_dark_rate, master_flat,
    CalibrateError,
};
use shared::drivers::DisplayChannel;
use shared::frame::{CapturedFrame, ExposureRequest, FrameHeader, SequenceKind};
use shared::frame_store::NightStore;
use shared::image_proc::frame_median;

use crate::config::RigConfig;
use crate::events::RigEvent;
use crate::session::CameraSession;
use crate::solver::SolverHandle;

/// Subsample seed for flat normalization, fixed so a re-stack of the
/// same frames reproduces the same master.
const FLAT_STACK_SEED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Running,
    AbortRequested,
    Aborted,
    Completed,
    Failed,
}

/// How a finished workflow ended. `FlatNotAchievable` is a sentinel the
/// caller consumes to abandon the flat sequence; it is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed,
    Aborted,
    Failed(String),
    FlatNotAchievable,
}

/// Operator request for one sequence.
#[derive(Debug, Clone)]
pub struct SequenceParams {
    /// Frames requested. Per-kind floors may raise this; zero means "as
    /// many as allowed" for continuous sequences and one otherwise.
    pub count: usize,
    pub exptime_s: f64,
    /// Pause between frames.
    pub delay_s: f64,
}

impl SequenceParams {
    pub fn new(count: usize, exptime_s: f64) -> Self {
        Self {
            count,
            exptime_s,
            delay_s: 0.0,
        }
    }

    pub fn with_delay(mut self, delay_s: f64) -> Self {
        self.delay_s = delay_s.max(0.0);
        self
    }
}

/// What the workflow is waiting on after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// An exposure is in flight; call `resume` with the frame.
    AwaitFrame,
    /// Sleeping between frames; call `poll` at or after the instant.
    AwaitDelay(Instant),
    /// The workflow is finished and can be dropped.
    Done(WorkflowOutcome),
}

/// The suspend point the machine will resume from.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Waiting for sequence frame `index`.
    Expose { index: usize },
    /// Waiting for a flat search test exposure.
    FlatProbe { attempt: usize, exptime_s: f64 },
    /// Waiting out the inter-frame delay.
    Delay { resume_at: Instant, next_index: usize },
    Finished,
}

/// Master calibration frames, loaded lazily from the store and then
/// held unchanged for the rest of the session.
#[derive(Default)]
pub struct MasterCache {
    bias: Option<Option<Array2<f64>>>,
    dark_rate: Option<Option<Array2<f64>>>,
    flat: Option<Option<Array2<f64>>>,
}

impl MasterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bias(&mut self, store: &NightStore) -> Option<&Array2<f64>> {
        Self::slot(&mut self.bias, store, SequenceKind::Bias)
    }

    /// Master dark in counts per second.
    pub fn dark_rate(&mut self, store: &NightStore) -> Option<&Array2<f64>> {
        Self::slot(&mut self.dark_rate, store, SequenceKind::Dark)
    }

    pub fn flat(&mut self, store: &NightStore) -> Option<&Array2<f64>> {
        Self::slot(&mut self.flat, store, SequenceKind::Flat)
    }

    fn slot<'a>(
        slot: &'a mut Option<Option<Array2<f64>>>,
        store: &NightStore,
        kind: SequenceKind,
    ) -> Option<&'a Array2<f64>> {
        slot.get_or_insert_with(|| match store.load_master(kind) {
            Ok(Some(master)) => {
                log::info!(
                    "loaded master {kind} ({}x{})",
                    master.nrows(),
                    master.ncols()
                );
                Some(master)
            }
            Ok(None) => {
                log::warn!("no master {kind} on disk, frames will go uncorrected");
                None
            }
            Err(e) => {
                log::warn!("could not read master {kind}: {e}");
                None
            }
        })
        .as_ref()
    }
}

/// Collaborators a workflow step runs against, borrowed from the
/// controller for the duration of one call.
pub struct WorkflowCtx<'a> {
    pub session: &'a CameraSession,
    pub store: &'a NightStore,
    pub config: &'a RigConfig,
    pub events: &'a Sender<RigEvent>,
    pub masters: &'a mut MasterCache,
    /// Mount position for light-frame headers, when known.
    pub position: Option<(f64, f64)>,
    pub solver: Option<&'a SolverHandle>,
    pub display: &'a mut dyn DisplayChannel,
}

pub struct AcquisitionWorkflow {
    kind: SequenceKind,
    state: WorkflowState,
    step: Step,
    count: usize,
    exptime_s: f64,
    delay: Duration,
    saved: usize,
    /// Frames collected for master stacking; calibration kinds only.
    stack: Vec<Array2<f64>>,
    stack_date: Option<NaiveDate>,
    outcome: Option<WorkflowOutcome>,
    cleanup_done: bool,
}

impl AcquisitionWorkflow {
    /// Begin a sequence: resolve per-kind frame floors, then issue the
    /// first exposure request (or the first flat search probe). The
    /// returned outcome is `Done` immediately if the request failed.
    pub fn start(
        kind: SequenceKind,
        params: SequenceParams,
        ctx: &mut WorkflowCtx<'_>,
    ) -> (Self, StepOutcome) {
        let stacking = ctx.config.stacking.clone();
        let (count, exptime_s) = match kind {
            SequenceKind::Bias => (params.count.max(stacking.min_bias_frames), 0.0),
            // Darks honour both configured floors: the frame count and
            // the per-frame duration are each raised independently.
            SequenceKind::Dark => (
                params.count.max(stacking.min_dark_frames),
                params.exptime_s.max(stacking.min_dark_exptime_s),
            ),
            SequenceKind::Flat => {
                let flat = &ctx.config.flat;
                (
                    params.count.max(stacking.min_flat_frames),
                    params.exptime_s.clamp(flat.exptime_min_s, flat.exptime_max_s),
                )
            }
            SequenceKind::Science => (params.count.max(1), params.exptime_s),
            // Pointing checks are a single frame regardless of the
            // requested count.
            SequenceKind::Acquisition => (1, params.exptime_s),
            SequenceKind::Continuous => {
                let cap = stacking.max_continuous_frames;
                let count = if params.count == 0 {
                    cap
                } else {
                    params.count.min(cap)
                };
                (count, params.exptime_s)
            }
        };
        if count != params.count {
            log::info!("{kind} frame count adjusted to {count}");
        }

        let mut workflow = Self {
            kind,
            state: WorkflowState::Running,
            step: Step::Finished,
            count,
            exptime_s,
            delay: Duration::from_secs_f64(params.delay_s.max(0.0)),
            saved: 0,
            stack: Vec::new(),
            stack_date: None,
            outcome: None,
            cleanup_done: false,
        };
        workflow.log_event(
            ctx,
            format!("starting {kind} sequence: {count} x {exptime_s:.2}s"),
        );

        let outcome = if kind == SequenceKind::Flat {
            workflow.request_probe(ctx, 1, exptime_s)
        } else {
            workflow.request_frame(ctx, 0)
        };
        (workflow, outcome)
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn frames_saved(&self) -> usize {
        self.saved
    }

    /// Request a cooperative abort. The flag is honoured at the next
    /// suspend or resume boundary; the caller also cancels any in-flight
    /// exposure through the camera session so hardware time is freed.
    pub fn abort(&mut self) {
        if self.state == WorkflowState::Running {
            self.state = WorkflowState::AbortRequested;
            log::info!("{} abort requested", self.kind);
        }
    }

    /// Re-enter the machine with the frame it was suspended on.
    pub fn resume(&mut self, ctx: &mut WorkflowCtx<'_>, frame: CapturedFrame) -> StepOutcome {
        if self.abort_requested() {
            return self.finish(ctx, WorkflowOutcome::Aborted);
        }
        match self.step {
            Step::Expose { index } => self.handle_frame(ctx, frame, index),
            Step::FlatProbe { attempt, exptime_s } => {
                self.handle_probe(ctx, frame, attempt, exptime_s)
            }
            Step::Delay { resume_at, .. } => {
                log::warn!("{}: frame delivered during delay, ignoring", self.kind);
                StepOutcome::AwaitDelay(resume_at)
            }
            Step::Finished => self.done_outcome(),
        }
    }

    /// Drive time-based transitions: abort requests and delay expiry.
    pub fn poll(&mut self, ctx: &mut WorkflowCtx<'_>) -> StepOutcome {
        match self.step {
            Step::Finished => self.done_outcome(),
            _ if self.abort_requested() => self.finish(ctx, WorkflowOutcome::Aborted),
            Step::Delay {
                resume_at,
                next_index,
            } => {
                if Instant::now() >= resume_at {
                    self.request_frame(ctx, next_index)
                } else {
                    StepOutcome::AwaitDelay(resume_at)
                }
            }
            Step::Expose { .. } | Step::FlatProbe { .. } => StepOutcome::AwaitFrame,
        }
    }

    /// The camera session reported the device unavailable while we were
    /// waiting on it.
    pub fn camera_unavailable(&mut self, ctx: &mut WorkflowCtx<'_>, reason: &str) -> StepOutcome {
        self.finish(
            ctx,
            WorkflowOutcome::Failed(format!("camera unavailable: {reason}")),
        )
    }

    fn abort_requested(&self) -> bool {
        self.state == WorkflowState::AbortRequested
    }

    fn request_frame(&mut self, ctx: &mut WorkflowCtx<'_>, index: usize) -> StepOutcome {
        if self.abort_requested() {
            return self.finish(ctx, WorkflowOutcome::Aborted);
        }
        let request = ExposureRequest::new(self.exptime_s, self.kind.is_light());
        match ctx.session.request_exposure(request) {
            Ok(()) => {
                self.step = Step::Expose { index };
                StepOutcome::AwaitFrame
            }
            Err(e) => self.finish(ctx, WorkflowOutcome::Failed(format!("exposure request: {e}"))),
        }
    }

    fn request_probe(
        &mut self,
        ctx: &mut WorkflowCtx<'_>,
        attempt: usize,
        exptime_s: f64,
    ) -> StepOutcome {
        if self.abort_requested() {
            return self.finish(ctx, WorkflowOutcome::Aborted);
        }
        match ctx
            .session
            .request_exposure(ExposureRequest::new(exptime_s, true))
        {
            Ok(()) => {
                self.step = Step::FlatProbe { attempt, exptime_s };
                StepOutcome::AwaitFrame
            }
            Err(e) => self.finish(ctx, WorkflowOutcome::Failed(format!("exposure request: {e}"))),
        }
    }

    fn handle_frame(
        &mut self,
        ctx: &mut WorkflowCtx<'_>,
        frame: CapturedFrame,
        index: usize,
    ) -> StepOutcome {
        // Continuous frames are monitoring only and stay off disk.
        let path = if self.kind == SequenceKind::Continuous {
            None
        } else {
            let header = FrameHeader::for_frame(&frame, self.kind).with_position(ctx.position);
            let seq_index = if self.count > 1 { Some(index) } else { None };
            match ctx.store.save_frame(&frame, &header, seq_index) {
                Ok(path) => Some(path),
                Err(e) => {
                    return self.finish(ctx, WorkflowOutcome::Failed(format!("saving frame: {e}")))
                }
            }
        };

        if self.kind.is_calibration() {
            if self.stack_date.is_none() {
                self.stack_date = Some(frame.captured_at.date_naive());
            }
            self.stack.push(frame.pixels_f64());
        }

        if self.kind == SequenceKind::Acquisition {
            if let Some(solver) = ctx.solver {
                let calibrated = calibrated_copy(ctx, &frame);
                if !solver.submit(calibrated, ctx.position) {
                    log::debug!("solver busy, acquisition frame not queued");
                }
            }
        }

        match &path {
            Some(path) => {
                ctx.display
                    .notify("display_frame", &[("path", path.display().to_string())]);
            }
            // Unsaved frames are announced by shape so the display can
            // still show them live.
            None => {
                let (height, width) = frame.pixels.dim();
                ctx.display
                    .notify("display_frame", &[("shape", format!("{width}x{height}"))]);
            }
        }

        self.saved += 1;
        let _ = ctx.events.send(RigEvent::FrameReady {
            kind: self.kind,
            index,
            simulated: frame.simulated,
            path,
        });

        if self.saved >= self.count {
            return self.complete(ctx);
        }
        let next_index = index + 1;
        if self.delay > Duration::ZERO {
            let resume_at = Instant::now() + self.delay;
            self.step = Step::Delay {
                resume_at,
                next_index,
            };
            return StepOutcome::AwaitDelay(resume_at);
        }
        self.request_frame(ctx, next_index)
    }

    /// One flat search probe came back: accept the exposure time or
    /// rescale and retry. The probe frame itself is never saved.
    fn handle_probe(
        &mut self,
        ctx: &mut WorkflowCtx<'_>,
        frame: CapturedFrame,
        attempt: usize,
        exptime_s: f64,
    ) -> StepOutcome {
        let pixels = frame.pixels_f64();
        let median = match ctx.masters.bias(ctx.store) {
            Some(bias) => match bias_subtract(&pixels.view(), &bias.view()) {
                Ok(corrected) => frame_median(&corrected.view()),
                Err(e) => {
                    log::warn!("flat probe bias subtract failed ({e}), using raw median");
                    frame_median(&pixels.view())
                }
            },
            None => frame_median(&pixels.view()),
        };

        let flat = ctx.config.flat.clone();
        if median >= flat.counts_min && median <= flat.counts_max {
            self.log_event(
                ctx,
                format!("flat exposure {exptime_s:.2}s gives median {median:.0}, starting sequence"),
            );
            self.exptime_s = exptime_s;
            return self.request_frame(ctx, 0);
        }

        if median <= 0.0 {
            log::warn!("flat probe median {median:.0} is not positive");
            return self.finish(ctx, WorkflowOutcome::FlatNotAchievable);
        }
        let next = exptime_s * flat.target() / median;
        if next < flat.exptime_min_s || next > flat.exptime_max_s {
            log::warn!(
                "flat search wants {next:.2}s, outside [{:.2}, {:.2}]",
                flat.exptime_min_s,
                flat.exptime_max_s
            );
            return self.finish(ctx, WorkflowOutcome::FlatNotAchievable);
        }
        if attempt >= flat.max_attempts {
            log::warn!("flat search gave up after {attempt} probes");
            return self.finish(ctx, WorkflowOutcome::FlatNotAchievable);
        }
        log::info!("flat probe median {median:.0} out of range, retrying at {next:.2}s");
        self.request_probe(ctx, attempt + 1, next)
    }

    /// The last frame of the sequence arrived; stack a master if this
    /// was a calibration kind.
    fn complete(&mut self, ctx: &mut WorkflowCtx<'_>) -> StepOutcome {
        if let Some(result) = self.build_master() {
            match result {
                Ok(master) => {
                    let date = self
                        .stack_date
                        .unwrap_or_else(|| Utc::now().date_naive());
                    match ctx.store.save_master(self.kind, date, &master) {
                        Ok(path) => self.log_event(
                            ctx,
                            format!("master {} saved to {}", self.kind, path.display()),
                        ),
                        Err(e) => {
                            return self.finish(
                                ctx,
                                WorkflowOutcome::Failed(format!("saving master: {e}")),
                            )
                        }
                    }
                }
                Err(e) => {
                    return self
                        .finish(ctx, WorkflowOutcome::Failed(format!("stacking master: {e}")))
                }
            }
        }
        self.finish(ctx, WorkflowOutcome::Completed)
    }

    fn build_master(&self) -> Option<Result<Array2<f64>, CalibrateError>> {
        match self.kind {
            SequenceKind::Bias => Some(master_bias(&self.stack)),
            SequenceKind::Dark => Some(master_dark_rate(&self.stack, self.exptime_s)),
            SequenceKind::Flat => Some(master_flat(&self.stack, FLAT_STACK_SEED)),
            _ => None,
        }
    }

    /// Terminal transition. The cleanup block runs exactly once no
    /// matter which path finished the workflow.
    fn finish(&mut self, ctx: &mut WorkflowCtx<'_>, outcome: WorkflowOutcome) -> StepOutcome {
        if !self.cleanup_done {
            self.cleanup_done = true;
            match &outcome {
                WorkflowOutcome::Completed => self.log_event(
                    ctx,
                    format!("{} sequence complete, {} frames", self.kind, self.saved),
                ),
                WorkflowOutcome::Aborted => {
                    let line = format!("{} sequence aborted after {} frames", self.kind, self.saved);
                    log::warn!("{line}");
                    let _ = ctx.events.send(RigEvent::LogLine(line));
                }
                WorkflowOutcome::Failed(reason) => {
                    let line = format!("{} sequence failed: {reason}", self.kind);
                    log::error!("{line}");
                    let _ = ctx.events.send(RigEvent::LogLine(line));
                }
                WorkflowOutcome::FlatNotAchievable => {
                    let line = "flat target counts not achievable, abandoning sequence".to_string();
                    log::warn!("{line}");
                    let _ = ctx.events.send(RigEvent::LogLine(line));
                }
            }
        }
        self.state = match &outcome {
            WorkflowOutcome::Completed | WorkflowOutcome::FlatNotAchievable => {
                WorkflowState::Completed
            }
            WorkflowOutcome::Aborted => WorkflowState::Aborted,
            WorkflowOutcome::Failed(_) => WorkflowState::Failed,
        };
        self.step = Step::Finished;
        self.outcome = Some(outcome.clone());
        StepOutcome::Done(outcome)
    }

    fn done_outcome(&self) -> StepOutcome {
        StepOutcome::Done(
            self.outcome
                .clone()
                .unwrap_or(WorkflowOutcome::Completed),
        )
    }

    fn log_event(&self, ctx: &WorkflowCtx<'_>, line: String) {
        log::info!("{line}");
        let _ = ctx.events.send(RigEvent::LogLine(line));
    }
}

/// Apply whichever masters exist to a copy of the frame, for display
/// and plate solving. The saved frame stays raw; missing masters are a
/// quality warning, not an error.
pub fn calibrated_copy(ctx: &mut WorkflowCtx<'_>, frame: &CapturedFrame) -> Array2<f64> {
    let mut pixels = frame.pixels_f64();
    if let Some(bias) = ctx.masters.bias(ctx.store) {
        match bias_subtract(&pixels.view(), &bias.view()) {
            Ok(out) => pixels = out,
            Err(e) => log::warn!("bias subtract skipped: {e}"),
        }
    }
    if let Some(rate) = ctx.masters.dark_rate(ctx.store) {
        match dark_subtract(
            &pixels.view(),
            &rate.view(),
            frame.exptime_s,
            ctx.config.stacking.dark_ceiling,
        ) {
            Ok(out) => pixels = out,
            Err(e) => log::warn!("dark subtract skipped: {e}"),
        }
    }
    if let Some(flat) = ctx.masters.flat(ctx.store) {
        match flat_divide(&pixels.view(), &flat.view()) {
            Ok(out) => pixels = out,
            Err(e) => log::warn!("flat divide skipped: {e}"),
        }
    }
    pixels
}
