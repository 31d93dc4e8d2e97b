//! Actuator calibration training.
//!
//! Discovers, for the fast corrector and then the mount, how device step
//! channels map onto image axes: whether the channels are swapped, the
//! sign of each, and the step scale. Nothing is assumed up front; a
//! provisional one-step-per-pixel mapping is installed so commanded
//! offsets reach the device as raw step counts, and the trained mapping
//! replaces it.
//!
//! Each axis runs a bracket test: step by a negative offset, measure the
//! star, step by twice the offset positive, measure again. The second
//! displacement's dominant component identifies the image axis the
//! channel drives (resolving swap before sign), its sign gives the
//! channel inversion, and its size the scale. Magnitudes grow until the
//! displacement clears the measurement noise floor.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam_channel::Receiver;
use nalgebra::Vector2;
use thiserror::Error;

use shared::drivers::Axis;
use shared::frame::ExposureRequest;
use shared::image_proc::locate_star;

use crate::config::GuidingConfig;
use crate::guiding::{AxisCalibration, AxisSpace, GuideCalibrations, GuideCorrection, GuideLoop};
use crate::session::{CameraSession, SessionError, SessionEvent};

/// Search box for the training star, in pixels.
const TRAIN_BOX: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibratorState {
    Idle,
    TrainingFast,
    TrainingMount,
    Trained,
    Failed,
}

#[derive(Error, Debug)]
pub enum CalibratorError {
    #[error("guide camera unavailable: {0}")]
    CameraUnavailable(String),

    /// The star never moved measurably, even at the largest magnitude.
    #[error("no measurable response from {space:?} device axis {axis:?}")]
    NoResponse { space: AxisSpace, axis: Axis },

    #[error("guide loop has exited")]
    LoopClosed,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Measured image response of one device axis.
#[derive(Debug, Clone, Copy)]
struct AxisProbe {
    /// Star displacement produced by the positive bracket move.
    displacement: Vector2<f64>,
    /// Steps commanded for that move.
    steps: f64,
}

pub struct ActuatorCalibrator<'a> {
    session: &'a CameraSession,
    events: Receiver<SessionEvent>,
    guide_loop: &'a GuideLoop,
    calibrations: Arc<RwLock<GuideCalibrations>>,
    config: GuidingConfig,
    state: CalibratorState,
}

impl<'a> ActuatorCalibrator<'a> {
    pub fn new(
        session: &'a CameraSession,
        guide_loop: &'a GuideLoop,
        calibrations: Arc<RwLock<GuideCalibrations>>,
        config: GuidingConfig,
    ) -> Self {
        let events = session.events();
        Self {
            session,
            events,
            guide_loop,
            calibrations,
            config,
            state: CalibratorState::Idle,
        }
    }

    pub fn state(&self) -> CalibratorState {
        self.state
    }

    /// Train both correctors. On failure the previous calibrations are
    /// restored untouched.
    pub fn run(&mut self) -> Result<GuideCalibrations, CalibratorError> {
        let originals = *self.calibrations.read().unwrap();
        self.session.enable();
        match self.train_all() {
            Ok(trained) => {
                self.state = CalibratorState::Trained;
                Ok(trained)
            }
            Err(e) => {
                *self.calibrations.write().unwrap() = originals;
                self.state = CalibratorState::Failed;
                Err(e)
            }
        }
    }

    fn train_all(&mut self) -> Result<GuideCalibrations, CalibratorError> {
        self.state = CalibratorState::TrainingFast;
        log::info!("training fast corrector axes");
        self.set_calibration(AxisSpace::Fast, AxisCalibration::identity());
        let fast = self.train_space(AxisSpace::Fast)?;
        log::info!(
            "fast corrector: swapped={} invert_x={} invert_y={} {:.2} steps/px",
            fast.axes_swapped,
            fast.invert_x,
            fast.invert_y,
            fast.steps_per_pixel
        );
        self.set_calibration(AxisSpace::Fast, fast);

        self.state = CalibratorState::TrainingMount;
        log::info!("training mount axes");
        self.set_calibration(AxisSpace::Mount, AxisCalibration::identity());
        let mount = self.train_space(AxisSpace::Mount)?;
        log::info!(
            "mount: swapped={} invert_x={} invert_y={} {:.2} steps/px",
            mount.axes_swapped,
            mount.invert_x,
            mount.invert_y,
            mount.steps_per_pixel
        );
        self.set_calibration(AxisSpace::Mount, mount);

        self.recentre()?;
        Ok(*self.calibrations.read().unwrap())
    }

    fn set_calibration(&self, space: AxisSpace, calibration: AxisCalibration) {
        let mut calibrations = self.calibrations.write().unwrap();
        match space {
            AxisSpace::Fast => calibrations.fast = calibration,
            AxisSpace::Mount => calibrations.mount = calibration,
        }
    }

    fn train_space(&mut self, space: AxisSpace) -> Result<AxisCalibration, CalibratorError> {
        let x = self.probe_axis(space, Axis::X)?;
        let y = self.probe_axis(space, Axis::Y)?;
        Ok(derive_calibration(x, y))
    }

    /// Bracket-test one device axis, growing the magnitude until the
    /// response clears the noise floor.
    fn probe_axis(&mut self, space: AxisSpace, axis: Axis) -> Result<AxisProbe, CalibratorError> {
        let magnitudes = self.config.train_magnitudes.clone();
        for magnitude in magnitudes {
            self.recentre()?;
            let start = self.measure_star()?;

            self.command_steps(space, axis, -magnitude)?;
            let after_negative = self.measure_star()?;
            log::debug!(
                "{space:?} {axis:?} -{magnitude} steps moved star {:.2} px",
                (after_negative - start).norm()
            );

            self.command_steps(space, axis, 2.0 * magnitude)?;
            let after_positive = self.measure_star()?;
            let displacement = after_positive - after_negative;

            if displacement.norm() >= self.config.min_train_displacement_px {
                return Ok(AxisProbe {
                    displacement,
                    steps: 2.0 * magnitude,
                });
            }
            log::debug!(
                "{space:?} {axis:?} response {:.2} px below noise floor at {magnitude} steps",
                displacement.norm()
            );
        }
        Err(CalibratorError::NoResponse { space, axis })
    }

    /// Send raw steps along one device axis. Runs under the provisional
    /// identity calibration, so pixels equal steps.
    fn command_steps(
        &self,
        space: AxisSpace,
        axis: Axis,
        steps: f64,
    ) -> Result<(), CalibratorError> {
        let (dx, dy) = match axis {
            Axis::X => (steps, 0.0),
            Axis::Y => (0.0, steps),
        };
        if !self.guide_loop.send(GuideCorrection::Move { space, dx, dy }) {
            return Err(CalibratorError::LoopClosed);
        }
        self.settle();
        Ok(())
    }

    fn recentre(&self) -> Result<(), CalibratorError> {
        if !self.guide_loop.send(GuideCorrection::Centre) {
            return Err(CalibratorError::LoopClosed);
        }
        self.settle();
        Ok(())
    }

    fn settle(&self) {
        std::thread::sleep(Duration::from_secs_f64(self.config.settle_s.max(0.0)));
    }

    fn measure_star(&mut self) -> Result<Vector2<f64>, CalibratorError> {
        self.session
            .request_exposure(ExposureRequest::new(self.config.exptime_s, true))?;
        let timeout = Duration::from_secs_f64(self.config.exptime_s * 2.0 + 10.0);
        match self.events.recv_timeout(timeout) {
            Ok(SessionEvent::Frame(frame)) => {
                let pixels = frame.pixels_f64();
                Ok(locate_star(&pixels.view(), TRAIN_BOX))
            }
            Ok(SessionEvent::Unavailable(reason)) => {
                Err(CalibratorError::CameraUnavailable(reason))
            }
            Err(_) => Err(CalibratorError::CameraUnavailable(
                "no frame delivered".into(),
            )),
        }
    }
}

/// Combine the two axis probes into a calibration. Swap is resolved
/// first, from the dominant component of the device-X response; sign
/// interpretation depends on it.
fn derive_calibration(x: AxisProbe, y: AxisProbe) -> AxisCalibration {
    let axes_swapped = x.displacement.y.abs() > x.displacement.x.abs();
    let y_agrees = (y.displacement.x.abs() > y.displacement.y.abs()) == axes_swapped;
    if !y_agrees {
        log::warn!(
            "axis probes disagree on swap (x response {:?}, y response {:?}); trusting device X",
            (x.displacement.x, x.displacement.y),
            (y.displacement.x, y.displacement.y)
        );
    }

    // Per-channel gain in pixels per step, along the image axis each
    // channel actually drives.
    let gain_x = if axes_swapped {
        x.displacement.y
    } else {
        x.displacement.x
    } / x.steps;
    let gain_y = if axes_swapped {
        y.displacement.x
    } else {
        y.displacement.y
    } / y.steps;

    let scale_x = 1.0 / gain_x.abs();
    let scale_y = 1.0 / gain_y.abs();
    AxisCalibration {
        steps_per_pixel: (scale_x + scale_y) / 2.0,
        axes_swapped,
        invert_x: gain_x < 0.0,
        invert_y: gain_y < 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn probe(dx: f64, dy: f64, steps: f64) -> AxisProbe {
        AxisProbe {
            displacement: Vector2::new(dx, dy),
            steps,
        }
    }

    #[test]
    fn straight_geometry_is_recovered() {
        // Device X moves the star +x, device Y moves it +y, 1/6 px/step.
        let calibration = derive_calibration(probe(10.0, 0.2, 60.0), probe(-0.1, 10.0, 60.0));
        assert!(!calibration.axes_swapped);
        assert!(!calibration.invert_x);
        assert!(!calibration.invert_y);
        assert_relative_eq!(calibration.steps_per_pixel, 6.0, epsilon = 0.01);
    }

    #[test]
    fn swap_is_resolved_before_sign() {
        // Device X drives image -y, device Y drives image +x.
        let calibration = derive_calibration(probe(0.1, -12.0, 60.0), probe(12.0, -0.3, 60.0));
        assert!(calibration.axes_swapped);
        // After the swap, the device X channel's sign comes from the y
        // component it drives.
        assert!(calibration.invert_x);
        assert!(!calibration.invert_y);
        assert_relative_eq!(calibration.steps_per_pixel, 5.0, epsilon = 0.01);
    }

    #[test]
    fn scale_averages_both_channels() {
        let calibration = derive_calibration(probe(10.0, 0.0, 60.0), probe(0.0, 15.0, 60.0));
        // 6 steps/px and 4 steps/px average to 5.
        assert_relative_eq!(calibration.steps_per_pixel, 5.0, epsilon = 1e-9);
    }
}
