//! Guide correction loop and actuator calibrations.
//!
//! The loop owns both correctors (the fast tip-tilt element and the
//! mount's guide input) on its own thread and consumes a queue of
//! [`GuideCorrection`] commands. A backlog is coalesced down to the most
//! recent `Move`; `Stop` and `Centre` short-circuit the coalescing and
//! apply immediately. Commands are spaced by a minimum interval and
//! corrections below the dead-band apply nothing.
//!
//! When the fast element runs out of travel the loop recentres it and
//! hands the correction it had accumulated to the mount, keeping the
//! star where it was.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use shared::drivers::{ActuatorDriver, Axis, StepResult};

use crate::config::{ConfigError, GuidingConfig};

/// Which corrector a `Move` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSpace {
    Fast,
    Mount,
}

/// Command consumed by the correction thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuideCorrection {
    /// Move the star by (dx, dy) pixels in image space.
    Move { space: AxisSpace, dx: f64, dy: f64 },
    /// Recentre the fast element.
    Centre,
    /// Disconnect the correctors and end the thread.
    Stop,
}

/// Image-space to device-step mapping for one actuator, as discovered by
/// training. `axes_swapped` routes image x to the device's Y channel and
/// vice versa; the inversions flip the device channel sign after the
/// swap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisCalibration {
    pub steps_per_pixel: f64,
    pub axes_swapped: bool,
    pub invert_x: bool,
    pub invert_y: bool,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self {
            steps_per_pixel: 6.0,
            axes_swapped: false,
            invert_x: false,
            invert_y: false,
        }
    }
}

impl AxisCalibration {
    /// One step per pixel, no swap, no inversion. Training runs under
    /// this mapping so commanded pixel offsets become raw step counts.
    pub fn identity() -> Self {
        Self {
            steps_per_pixel: 1.0,
            axes_swapped: false,
            invert_x: false,
            invert_y: false,
        }
    }

    /// Device step counts for a desired image-space move.
    pub fn to_steps(&self, dx: f64, dy: f64) -> (i32, i32) {
        let (u, v) = if self.axes_swapped { (dy, dx) } else { (dx, dy) };
        let sx = u * self.steps_per_pixel * if self.invert_x { -1.0 } else { 1.0 };
        let sy = v * self.steps_per_pixel * if self.invert_y { -1.0 } else { 1.0 };
        (sx.round() as i32, sy.round() as i32)
    }
}

/// Calibrations for both correctors, persisted between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideCalibrations {
    pub fast: AxisCalibration,
    pub mount: AxisCalibration,
}

impl GuideCalibrations {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut calibrations: Self = serde_json::from_reader(reader)?;
        calibrations.sanitize();
        Ok(calibrations)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    fn sanitize(&mut self) {
        for (name, calibration) in [("fast", &mut self.fast), ("mount", &mut self.mount)] {
            if !(calibration.steps_per_pixel > 0.0) || !calibration.steps_per_pixel.is_finite() {
                log::warn!(
                    "{name} calibration scale {} invalid, using default",
                    calibration.steps_per_pixel
                );
                calibration.steps_per_pixel = AxisCalibration::default().steps_per_pixel;
            }
        }
    }

    pub fn for_space(&self, space: AxisSpace) -> AxisCalibration {
        match space {
            AxisSpace::Fast => self.fast,
            AxisSpace::Mount => self.mount,
        }
    }
}

/// Loop timing, from [`GuidingConfig`].
#[derive(Debug, Clone)]
pub struct GuideLoopConfig {
    pub min_step_interval: Duration,
    pub dead_band_px: f64,
}

impl From<&GuidingConfig> for GuideLoopConfig {
    fn from(config: &GuidingConfig) -> Self {
        Self {
            min_step_interval: Duration::from_secs_f64(config.min_step_interval_s.max(0.0)),
            dead_band_px: config.dead_band_px.max(0.0),
        }
    }
}

/// Handle to the correction thread.
pub struct GuideLoop {
    tx: Sender<GuideCorrection>,
    thread: Option<JoinHandle<()>>,
}

impl GuideLoop {
    pub fn spawn(
        fast: Box<dyn ActuatorDriver>,
        mount: Box<dyn ActuatorDriver>,
        calibrations: Arc<RwLock<GuideCalibrations>>,
        config: GuideLoopConfig,
    ) -> Self {
        let (tx, rx) = unbounded();
        let worker = CorrectionWorker {
            fast,
            mount,
            calibrations,
            config,
            last_applied: None,
            accumulated_fast: Vector2::zeros(),
        };
        let thread = std::thread::spawn(move || worker.run(rx));
        Self {
            tx,
            thread: Some(thread),
        }
    }

    /// Queue a correction. Returns false when the thread has exited.
    pub fn send(&self, correction: GuideCorrection) -> bool {
        self.tx.send(correction).is_ok()
    }

    pub fn sender(&self) -> Sender<GuideCorrection> {
        self.tx.clone()
    }

    /// Stop the thread and wait for the correctors to disconnect.
    pub fn stop(mut self) {
        let _ = self.tx.send(GuideCorrection::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for GuideLoop {
    fn drop(&mut self) {
        let _ = self.tx.send(GuideCorrection::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct CorrectionWorker {
    fast: Box<dyn ActuatorDriver>,
    mount: Box<dyn ActuatorDriver>,
    calibrations: Arc<RwLock<GuideCalibrations>>,
    config: GuideLoopConfig,
    last_applied: Option<Instant>,
    /// Fast corrections applied since the element was last centred, in
    /// pixels. This is what the mount inherits at a travel limit.
    accumulated_fast: Vector2<f64>,
}

impl CorrectionWorker {
    fn run(mut self, rx: Receiver<GuideCorrection>) {
        match self.fast.connect() {
            Ok(true) => log::info!("guide loop: {} connected", self.fast.name()),
            Ok(false) => {
                log::error!("guide loop: {} refused connection", self.fast.name());
                return;
            }
            Err(e) => {
                log::error!("guide loop: {} connect failed: {e}", self.fast.name());
                return;
            }
        }
        match self.mount.connect() {
            Ok(true) => {}
            Ok(false) => log::warn!("guide loop: {} refused, no mount handoff", self.mount.name()),
            Err(e) => log::warn!(
                "guide loop: {} connect failed, no mount handoff: {e}",
                self.mount.name()
            ),
        }

        loop {
            let first = match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            };
            match coalesce(first, &rx) {
                GuideCorrection::Stop => break,
                GuideCorrection::Centre => {
                    self.wait_for_spacing();
                    self.centre_fast();
                }
                GuideCorrection::Move { space, dx, dy } => {
                    if dx.hypot(dy) < self.config.dead_band_px {
                        // Below the dead-band nothing is applied and the
                        // rate-limit clock keeps its last value.
                        continue;
                    }
                    self.wait_for_spacing();
                    self.apply_move(space, dx, dy);
                }
            }
        }

        self.fast.disconnect();
        self.mount.disconnect();
        log::info!("guide loop stopped");
    }

    /// Sleep out the remainder of the minimum inter-command spacing,
    /// then mark now as the last applied command.
    fn wait_for_spacing(&mut self) {
        if let Some(last) = self.last_applied {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_step_interval {
                std::thread::sleep(self.config.min_step_interval - elapsed);
            }
        }
        self.last_applied = Some(Instant::now());
    }

    fn centre_fast(&mut self) {
        match self.fast.centre() {
            Ok(true) => {
                self.accumulated_fast = Vector2::zeros();
                log::info!("fast corrector recentred");
            }
            Ok(false) => log::warn!("fast corrector refused to recentre"),
            Err(e) => log::warn!("fast corrector centre failed: {e}"),
        }
    }

    fn apply_move(&mut self, space: AxisSpace, dx: f64, dy: f64) {
        let calibration = self.calibrations.read().unwrap().for_space(space);
        let (sx, sy) = calibration.to_steps(dx, dy);
        log::debug!("guide move {space:?} ({dx:.2}, {dy:.2}) px -> steps ({sx}, {sy})");

        let mut limited = false;
        let driver = match space {
            AxisSpace::Fast => &mut self.fast,
            AxisSpace::Mount => &mut self.mount,
        };
        for (axis, count) in [(Axis::X, sx), (Axis::Y, sy)] {
            if count == 0 {
                continue;
            }
            match driver.step(axis, count) {
                Ok(StepResult::Ack) => {}
                Ok(StepResult::Limit) => {
                    limited = true;
                    log::warn!("{} hit travel limit on {axis:?}", driver.name());
                }
                Ok(StepResult::Fail) => {
                    log::warn!("{} refused {count} steps on {axis:?}", driver.name());
                }
                Err(e) => log::error!("{} step failed: {e}", driver.name()),
            }
        }

        if space == AxisSpace::Fast {
            self.accumulated_fast += Vector2::new(dx, dy);
            if limited {
                self.hand_off_to_mount();
            }
        }
    }

    /// The fast element is out of travel: recentre it and have the mount
    /// take over the correction it was holding.
    fn hand_off_to_mount(&mut self) {
        let carried = self.accumulated_fast;
        log::info!(
            "handing ({:.2}, {:.2}) px of accumulated correction to the mount",
            carried.x,
            carried.y
        );
        self.centre_fast();

        let calibration = self.calibrations.read().unwrap().mount;
        let (sx, sy) = calibration.to_steps(carried.x, carried.y);
        for (axis, count) in [(Axis::X, sx), (Axis::Y, sy)] {
            if count == 0 {
                continue;
            }
            match self.mount.step(axis, count) {
                Ok(StepResult::Ack) => {}
                Ok(other) => log::warn!("mount handoff on {axis:?} returned {other:?}"),
                Err(e) => log::error!("mount handoff step failed: {e}"),
            }
        }
    }
}

/// Collapse a backlog to the newest `Move`; `Stop` and `Centre` apply
/// immediately, leaving anything behind them queued.
fn coalesce(first: GuideCorrection, rx: &Receiver<GuideCorrection>) -> GuideCorrection {
    let mut newest = first;
    loop {
        if matches!(newest, GuideCorrection::Stop | GuideCorrection::Centre) {
            return newest;
        }
        match rx.try_recv() {
            Ok(next) => newest = next,
            Err(_) => return newest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn to_steps_scales_and_rounds() {
        let calibration = AxisCalibration {
            steps_per_pixel: 6.0,
            ..AxisCalibration::identity()
        };
        assert_eq!(calibration.to_steps(1.0, -0.5), (6, -3));
        assert_eq!(calibration.to_steps(0.04, 0.0), (0, 0));
    }

    #[test]
    fn to_steps_swaps_before_inverting() {
        let calibration = AxisCalibration {
            steps_per_pixel: 2.0,
            axes_swapped: true,
            invert_x: true,
            invert_y: false,
        };
        // Image dy feeds the device X channel, then X is inverted.
        assert_eq!(calibration.to_steps(3.0, 5.0), (-10, 6));
    }

    #[test]
    fn coalesce_keeps_newest_move() {
        let (tx, rx) = unbounded();
        let mk = |dx| GuideCorrection::Move {
            space: AxisSpace::Fast,
            dx,
            dy: 0.0,
        };
        tx.send(mk(2.0)).unwrap();
        tx.send(mk(3.0)).unwrap();
        let applied = coalesce(mk(1.0), &rx);
        assert_eq!(applied, mk(3.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn coalesce_short_circuits_on_stop() {
        let (tx, rx) = unbounded();
        let mk = |dx| GuideCorrection::Move {
            space: AxisSpace::Fast,
            dx,
            dy: 0.0,
        };
        tx.send(GuideCorrection::Stop).unwrap();
        tx.send(mk(9.0)).unwrap();
        let applied = coalesce(mk(1.0), &rx);
        assert_eq!(applied, GuideCorrection::Stop);
        // The command behind the stop stays queued.
        assert_eq!(rx.try_recv().unwrap(), mk(9.0));
    }

    #[test]
    fn calibrations_round_trip_and_sanitize() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("calibrations.json");
        let mut calibrations = GuideCalibrations::default();
        calibrations.fast = AxisCalibration {
            steps_per_pixel: 5.5,
            axes_swapped: true,
            invert_x: false,
            invert_y: true,
        };
        calibrations.save(&path).unwrap();
        let loaded = GuideCalibrations::load(&path).unwrap();
        assert_eq!(loaded, calibrations);

        std::fs::write(&path, r#"{"fast": {"steps_per_pixel": -2.0}}"#).unwrap();
        let fixed = GuideCalibrations::load(&path).unwrap();
        assert!(fixed.fast.steps_per_pixel > 0.0);
    }
}
