//! The foreground rig coordinator.
//!
//! Single-threaded and event-driven: [`RigController::pump`] waits on
//! the two camera session channels, hands frames to whichever consumer
//! was waiting (the active workflow, or the guide observer), and drives
//! time-based workflow transitions. No call here blocks for more than
//! about a second without rechecking for abort and shutdown.
//!
//! The busy guard admits one workflow (or one training run) at a time.
//! Guiding is independent of the guard: the closed loop keeps running
//! while sequences acquire.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use nalgebra::Vector2;
use thiserror::Error;

use shared::drivers::{ActuatorDriver, CameraDriver, DisplayChannel, MountDriver};
use shared::frame::{ExposureRequest, SequenceKind};
use shared::frame_store::NightStore;
use shared::image_proc::locate_star;

use crate::calibrator::{ActuatorCalibrator, CalibratorError};
use crate::config::RigConfig;
use crate::events::RigEvent;
use crate::guiding::{
    AxisSpace, GuideCalibrations, GuideCorrection, GuideLoop, GuideLoopConfig,
};
use crate::session::{CameraRole, CameraSession, SessionEvent, SessionSettings};
use crate::solver::{PlateSolver, SolverHandle};
use crate::workflow::{
    AcquisitionWorkflow, MasterCache, SequenceParams, StepOutcome, WorkflowCtx, WorkflowState,
};

/// Longest the pump sleeps before rechecking flags.
const MAX_PUMP_WAIT: Duration = Duration::from_secs(1);
/// Search box for the guide star, in pixels.
const GUIDE_BOX: usize = 24;

#[derive(Error, Debug)]
pub enum ControllerError {
    /// Another workflow or training run owns the rig.
    #[error("rig is busy")]
    Busy,

    #[error("guide actuators are no longer available")]
    GuideLoopGone,

    #[error("guide camera: {0}")]
    GuideSession(#[from] crate::session::SessionError),

    #[error(transparent)]
    Training(#[from] CalibratorError),
}

/// Device handles the controller takes ownership of at construction.
/// Simulated and real drivers satisfy the same traits, so the choice is
/// made here, once, without recompilation anywhere else.
pub struct RigDrivers {
    pub main_camera: Box<dyn CameraDriver>,
    pub guide_camera: Box<dyn CameraDriver>,
    pub fast_actuator: Box<dyn ActuatorDriver>,
    pub mount_actuator: Box<dyn ActuatorDriver>,
    pub mount: Option<Box<dyn MountDriver>>,
    pub display: Box<dyn DisplayChannel>,
    pub solver: Option<Box<dyn PlateSolver>>,
}

pub struct RigController {
    config: RigConfig,
    store: NightStore,
    main_session: CameraSession,
    guide_session: CameraSession,
    main_events: Receiver<SessionEvent>,
    guide_events: Receiver<SessionEvent>,
    events_tx: Sender<RigEvent>,
    events_rx: Receiver<RigEvent>,
    workflow: Option<AcquisitionWorkflow>,
    /// Deadline of a pending inter-frame delay, bounding the pump wait.
    next_wake: Option<Instant>,
    busy: bool,
    masters: MasterCache,
    calibrations: Arc<RwLock<GuideCalibrations>>,
    /// Actuator handles waiting to be moved into the guide loop thread.
    actuators: Option<(Box<dyn ActuatorDriver>, Box<dyn ActuatorDriver>)>,
    guide_loop: Option<GuideLoop>,
    guiding_active: bool,
    /// Star position the closed loop holds; set by the first guide frame.
    lock_position: Option<Vector2<f64>>,
    mount: Option<Box<dyn MountDriver>>,
    display: Box<dyn DisplayChannel>,
    solver: Option<SolverHandle>,
}

impl RigController {
    pub fn new(config: RigConfig, drivers: RigDrivers) -> Self {
        let store = NightStore::new(&config.store_root);
        let settings = SessionSettings::from(&config.session);
        let main_session = CameraSession::spawn(
            "main-camera",
            drivers.main_camera,
            CameraRole::Main,
            settings.clone(),
        );
        let guide_session = CameraSession::spawn(
            "guide-camera",
            drivers.guide_camera,
            CameraRole::Guide,
            settings,
        );
        let main_events = main_session.events();
        let guide_events = guide_session.events();

        let calibrations = match GuideCalibrations::load(&config.calibrations_path) {
            Ok(calibrations) => {
                log::info!(
                    "loaded guide calibrations from {}",
                    config.calibrations_path.display()
                );
                calibrations
            }
            Err(e) => {
                log::warn!("no stored guide calibrations ({e}), using defaults");
                GuideCalibrations::default()
            }
        };

        let (events_tx, events_rx) = unbounded();
        let solver = drivers
            .solver
            .map(|engine| SolverHandle::spawn(engine, events_tx.clone()));

        Self {
            config,
            store,
            main_session,
            guide_session,
            main_events,
            guide_events,
            events_tx,
            events_rx,
            workflow: None,
            next_wake: None,
            busy: false,
            masters: MasterCache::new(),
            calibrations: Arc::new(RwLock::new(calibrations)),
            actuators: Some((drivers.fast_actuator, drivers.mount_actuator)),
            guide_loop: None,
            guiding_active: false,
            lock_position: None,
            mount: drivers.mount,
            display: drivers.display,
            solver,
        }
    }

    /// The operator-facing event stream.
    pub fn events(&self) -> Receiver<RigEvent> {
        self.events_rx.clone()
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// State of the active workflow, `Idle` when none is running.
    pub fn state(&self) -> WorkflowState {
        self.workflow
            .as_ref()
            .map(|workflow| workflow.state())
            .unwrap_or(WorkflowState::Idle)
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_guiding(&self) -> bool {
        self.guiding_active
    }

    /// Current guide calibrations (trained or defaults).
    pub fn calibrations(&self) -> GuideCalibrations {
        *self.calibrations.read().unwrap()
    }

    /// Begin a sequence. Fails with [`ControllerError::Busy`] and no side
    /// effects while another workflow or training run is active.
    pub fn start_sequence(
        &mut self,
        kind: SequenceKind,
        params: SequenceParams,
    ) -> Result<(), ControllerError> {
        if !self.start_working() {
            return Err(ControllerError::Busy);
        }
        self.main_session.enable();
        let position = self.mount_position();
        let (workflow, outcome) = {
            let mut ctx = WorkflowCtx {
                session: &self.main_session,
                store: &self.store,
                config: &self.config,
                events: &self.events_tx,
                masters: &mut self.masters,
                position,
                solver: self.solver.as_ref(),
                display: self.display.as_mut(),
            };
            AcquisitionWorkflow::start(kind, params, &mut ctx)
        };
        self.settle_workflow(workflow, outcome);
        Ok(())
    }

    /// Cooperatively abort the active workflow and cancel its in-flight
    /// exposure at the device level.
    pub fn abort_sequence(&mut self) {
        if let Some(workflow) = self.workflow.as_mut() {
            workflow.abort();
            self.main_session.abort_current();
        }
    }

    /// Run one turn of the event loop: wait up to `timeout` for a camera
    /// event, dispatch it, then drive any time-based transitions.
    pub fn pump(&mut self, timeout: Duration) {
        let mut wait = timeout.min(MAX_PUMP_WAIT);
        if let Some(at) = self.next_wake {
            wait = wait.min(at.saturating_duration_since(Instant::now()));
        }

        let main_events = self.main_events.clone();
        let guide_events = self.guide_events.clone();
        let mut select = Select::new();
        let main_index = select.recv(&main_events);
        select.recv(&guide_events);
        if let Ok(op) = select.select_timeout(wait) {
            // A selected operation must be completed with recv on the
            // matching channel.
            if op.index() == main_index {
                if let Ok(event) = op.recv(&main_events) {
                    self.on_main_event(event);
                }
            } else if let Ok(event) = op.recv(&guide_events) {
                self.on_guide_event(event);
            }
        }

        self.poll_workflow();
    }

    /// Start the closed guiding loop: spawn the correction thread if
    /// needed, recentre the fast element, and lock on the next star
    /// position. Idempotent while already guiding.
    pub fn start_guiding(&mut self) -> Result<(), ControllerError> {
        if self.guiding_active {
            return Ok(());
        }
        self.ensure_guide_loop()?;
        self.guide_session.enable();
        self.send_correction(GuideCorrection::Centre);
        self.lock_position = None;
        self.guiding_active = true;
        if let Err(e) = self.request_guide_frame() {
            self.guiding_active = false;
            return Err(ControllerError::GuideSession(e));
        }
        self.log_line("guiding started".to_string());
        Ok(())
    }

    /// Stop closed-loop guiding. The correction thread stays up, idle,
    /// so guiding can restart without reconnecting the correctors.
    pub fn stop_guiding(&mut self) {
        if !self.guiding_active {
            return;
        }
        self.guiding_active = false;
        self.lock_position = None;
        self.guide_session.abort_current();
        self.log_line("guiding stopped".to_string());
    }

    /// Run the actuator training procedure to completion. Blocks the
    /// coordinator; the busy guard keeps workflows out meanwhile.
    pub fn train_guiding(&mut self) -> Result<GuideCalibrations, ControllerError> {
        if !self.start_working() {
            return Err(ControllerError::Busy);
        }
        let was_guiding = self.guiding_active;
        if was_guiding {
            self.stop_guiding();
        }
        let result = self.run_training();
        self.stop_working();
        if let Err(e) = &result {
            log::error!("guide training failed: {e}");
        }
        result
    }

    /// Orderly shutdown: stop guiding, abort and settle any workflow,
    /// stop the correction thread, close the camera gates.
    pub fn shutdown(&mut self) {
        log::info!("rig controller shutting down");
        self.stop_guiding();
        self.abort_sequence();
        self.poll_workflow();
        if let Some(guide_loop) = self.guide_loop.take() {
            guide_loop.stop();
        }
        self.main_session.disable();
        self.guide_session.disable();
    }

    fn run_training(&mut self) -> Result<GuideCalibrations, ControllerError> {
        self.ensure_guide_loop()?;
        let guide_loop = match self.guide_loop.as_ref() {
            Some(guide_loop) => guide_loop,
            None => return Err(ControllerError::GuideLoopGone),
        };
        let mut calibrator = ActuatorCalibrator::new(
            &self.guide_session,
            guide_loop,
            Arc::clone(&self.calibrations),
            self.config.guiding.clone(),
        );
        let trained = calibrator.run()?;
        if let Err(e) = trained.save(&self.config.calibrations_path) {
            log::warn!("could not persist guide calibrations: {e}");
        }
        self.log_line(format!(
            "guide training complete: fast {:.2} steps/px, mount {:.2} steps/px",
            trained.fast.steps_per_pixel, trained.mount.steps_per_pixel
        ));
        Ok(trained)
    }

    fn ensure_guide_loop(&mut self) -> Result<(), ControllerError> {
        if self.guide_loop.is_some() {
            return Ok(());
        }
        match self.actuators.take() {
            Some((fast, mount)) => {
                let config = GuideLoopConfig::from(&self.config.guiding);
                self.guide_loop = Some(GuideLoop::spawn(
                    fast,
                    mount,
                    Arc::clone(&self.calibrations),
                    config,
                ));
                Ok(())
            }
            None => Err(ControllerError::GuideLoopGone),
        }
    }

    fn on_main_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Frame(frame) => {
                self.drive_workflow(|workflow, ctx| workflow.resume(ctx, frame));
            }
            SessionEvent::Unavailable(reason) => {
                if self.workflow.is_some() {
                    self.drive_workflow(|workflow, ctx| workflow.camera_unavailable(ctx, &reason));
                } else {
                    log::warn!("main camera unavailable: {reason}");
                }
            }
        }
    }

    fn on_guide_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Frame(frame) => {
                if !self.guiding_active {
                    // Stale frame from before a stop or a training run.
                    return;
                }
                let position = locate_star(&frame.pixels_f64().view(), GUIDE_BOX);
                match self.lock_position {
                    None => {
                        log::info!(
                            "guide lock at ({:.2}, {:.2})",
                            position.x,
                            position.y
                        );
                        self.lock_position = Some(position);
                    }
                    Some(lock) => {
                        let error = position - lock;
                        log::debug!(
                            "guide error ({:+.2}, {:+.2}) px",
                            error.x,
                            error.y
                        );
                        self.send_correction(GuideCorrection::Move {
                            space: AxisSpace::Fast,
                            dx: -error.x,
                            dy: -error.y,
                        });
                    }
                }
                if let Err(e) = self.request_guide_frame() {
                    log::warn!("guide exposure request failed: {e}");
                    self.guiding_active = false;
                }
            }
            SessionEvent::Unavailable(reason) => {
                if self.guiding_active {
                    self.guiding_active = false;
                    self.log_line(format!("guiding stopped: guide camera unavailable: {reason}"));
                } else {
                    log::warn!("guide camera unavailable: {reason}");
                }
            }
        }
    }

    fn request_guide_frame(&self) -> Result<(), crate::session::SessionError> {
        self.guide_session
            .request_exposure(ExposureRequest::new(self.config.guiding.exptime_s, true))
    }

    fn send_correction(&mut self, correction: GuideCorrection) {
        if let Some(guide_loop) = &self.guide_loop {
            if !guide_loop.send(correction) {
                log::warn!("guide loop exited, dropping correction");
                self.guiding_active = false;
            }
        }
    }

    fn poll_workflow(&mut self) {
        if self.workflow.is_some() {
            self.drive_workflow(|workflow, ctx| workflow.poll(ctx));
        }
    }

    /// Take the workflow out, run one step against a freshly assembled
    /// context, and put it back unless it finished.
    fn drive_workflow<F>(&mut self, f: F)
    where
        F: FnOnce(&mut AcquisitionWorkflow, &mut WorkflowCtx<'_>) -> StepOutcome,
    {
        let mut workflow = match self.workflow.take() {
            Some(workflow) => workflow,
            None => return,
        };
        let position = self.mount_position();
        let outcome = {
            let mut ctx = WorkflowCtx {
                session: &self.main_session,
                store: &self.store,
                config: &self.config,
                events: &self.events_tx,
                masters: &mut self.masters,
                position,
                solver: self.solver.as_ref(),
                display: self.display.as_mut(),
            };
            f(&mut workflow, &mut ctx)
        };
        self.settle_workflow(workflow, outcome);
    }

    fn settle_workflow(&mut self, workflow: AcquisitionWorkflow, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Done(outcome) => {
                self.next_wake = None;
                let _ = self.events_tx.send(RigEvent::WorkflowDone {
                    kind: workflow.kind(),
                    outcome,
                });
                self.stop_working();
            }
            StepOutcome::AwaitDelay(at) => {
                self.next_wake = Some(at);
                self.workflow = Some(workflow);
            }
            StepOutcome::AwaitFrame => {
                self.next_wake = None;
                self.workflow = Some(workflow);
            }
        }
    }

    fn mount_position(&mut self) -> Option<(f64, f64)> {
        self.mount.as_mut().and_then(|mount| mount.position().ok())
    }

    /// Claim the busy guard. Idempotent: a second claim returns false
    /// and changes nothing.
    fn start_working(&mut self) -> bool {
        if self.busy {
            return false;
        }
        self.busy = true;
        self.display
            .notify("set_working", &[("working", "true".to_string())]);
        true
    }

    /// Release the busy guard. Idempotent.
    fn stop_working(&mut self) {
        if !self.busy {
            return;
        }
        self.busy = false;
        self.display
            .notify("set_working", &[("working", "false".to_string())]);
    }

    fn log_line(&self, line: String) {
        log::info!("{line}");
        let _ = self.events_tx.send(RigEvent::LogLine(line));
    }
}

impl Drop for RigController {
    fn drop(&mut self) {
        if let Some(guide_loop) = self.guide_loop.take() {
            guide_loop.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::sim::{
        RecordingDisplay, SimActuator, SimCamera, SimChannel, SimGeometry, SimGuideCamera,
        SimMount, SimRig,
    };
    use tempfile::TempDir;

    fn sim_controller(dir: &TempDir) -> RigController {
        let rig = SimRig::new(SimGeometry::default(), SimGeometry::default());
        let mut config = RigConfig::default();
        config.store_root = dir.path().join("data");
        config.calibrations_path = dir.path().join("calib.json");
        RigController::new(
            config,
            RigDrivers {
                main_camera: Box::new(SimCamera::new("main", (32, 32), 7).with_instant_ready(true)),
                guide_camera: Box::new(
                    SimGuideCamera::new("guide", (32, 32), Arc::clone(&rig))
                        .with_instant_ready(true),
                ),
                fast_actuator: Box::new(SimActuator::new(
                    "tilt",
                    Arc::clone(&rig),
                    SimChannel::Fast,
                )),
                mount_actuator: Box::new(SimActuator::new(
                    "mount",
                    Arc::clone(&rig),
                    SimChannel::Mount,
                )),
                mount: Some(Box::new(SimMount::new(10.0, 20.0))),
                display: Box::new(RecordingDisplay::default()),
                solver: None,
            },
        )
    }

    #[test]
    fn busy_guard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = sim_controller(&dir);

        assert!(controller.start_working());
        assert!(!controller.start_working());
        controller.stop_working();
        controller.stop_working();
        assert!(controller.start_working());
        controller.stop_working();
    }

    #[test]
    fn idle_controller_reports_idle_state() {
        let dir = tempfile::tempdir().unwrap();
        let controller = sim_controller(&dir);
        assert_eq!(controller.state(), WorkflowState::Idle);
        assert!(!controller.is_busy());
        assert!(!controller.is_guiding());
    }

    #[test]
    fn second_start_returns_busy_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = sim_controller(&dir);

        controller
            .start_sequence(SequenceKind::Science, SequenceParams::new(2, 0.01))
            .unwrap();
        let before = controller.state();
        let err = controller
            .start_sequence(SequenceKind::Bias, SequenceParams::new(5, 0.0))
            .unwrap_err();
        assert!(matches!(err, ControllerError::Busy));
        assert_eq!(controller.state(), before);

        // Drain the rejected start's absence of events: only the first
        // sequence runs to completion.
        let events = controller.events();
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut done_kind = None;
        while Instant::now() < deadline {
            controller.pump(Duration::from_millis(50));
            if let Ok(RigEvent::WorkflowDone { kind, .. }) = events.try_recv() {
                done_kind = Some(kind);
                break;
            }
        }
        assert_eq!(done_kind, Some(SequenceKind::Science));
    }
}
