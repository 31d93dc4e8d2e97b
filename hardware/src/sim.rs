//! Simulated rig devices.
//!
//! Every driver trait has a simulated implementation here, backed by the
//! synthetic frame renderer in `shared`. The tilt actuator and the guide
//! camera are coupled through a shared [`SimRig`]: actuator steps move
//! the rendered guide star according to a configurable [`SimGeometry`],
//! so closed-loop guiding and calibration training run realistically
//! with no hardware attached.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use ndarray::Array2;
use tracing::debug;

use shared::drivers::{
    ActuatorDriver, Axis, CameraDriver, DisplayChannel, DriverError, DriverResult, MountDriver,
    StepResult,
};
use shared::image_proc::synth::{render, SynthScene};

struct Pending {
    started: Instant,
    exptime_s: f64,
    is_light: bool,
}

/// Simulated main imaging camera rendering a fixed star field.
pub struct SimCamera {
    label: String,
    dims: (usize, usize),
    field_seed: u64,
    /// Exposures complete immediately, for tests that should not sleep.
    instant_ready: bool,
    refuse_connects: u32,
    connected: bool,
    frame_index: u64,
    pending: Option<Pending>,
}

impl SimCamera {
    pub fn new(label: impl Into<String>, dims: (usize, usize), field_seed: u64) -> Self {
        Self {
            label: label.into(),
            dims,
            field_seed,
            instant_ready: false,
            refuse_connects: 0,
            connected: false,
            frame_index: 0,
            pending: None,
        }
    }

    pub fn with_instant_ready(mut self, instant: bool) -> Self {
        self.instant_ready = instant;
        self
    }

    /// Refuse the first `n` connect attempts, to exercise retry paths.
    pub fn refusing_connects(mut self, n: u32) -> Self {
        self.refuse_connects = n;
        self
    }

    fn next_noise_seed(&mut self) -> u64 {
        let seed = self.field_seed.wrapping_add(self.frame_index);
        self.frame_index += 1;
        seed
    }
}

impl CameraDriver for SimCamera {
    fn connect(&mut self) -> DriverResult<bool> {
        if self.refuse_connects > 0 {
            self.refuse_connects -= 1;
            debug!("{} refusing connect", self.label);
            return Ok(false);
        }
        self.connected = true;
        Ok(true)
    }

    fn start_exposure(&mut self, seconds: f64, is_light: bool) -> DriverResult<()> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        if self.pending.is_some() {
            return Err(DriverError::Rejected("exposure already in progress".into()));
        }
        self.pending = Some(Pending {
            started: Instant::now(),
            exptime_s: seconds,
            is_light,
        });
        Ok(())
    }

    fn is_ready(&mut self) -> DriverResult<bool> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| DriverError::Rejected("no exposure in progress".into()))?;
        Ok(self.instant_ready || pending.started.elapsed().as_secs_f64() >= pending.exptime_s)
    }

    fn read_pixels(&mut self) -> DriverResult<Array2<u16>> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| DriverError::Rejected("no exposure to read".into()))?;
        // A closed shutter sees no photons regardless of exposure time.
        let effective = if pending.is_light {
            pending.exptime_s
        } else {
            0.0
        };
        let noise_seed = self.next_noise_seed();
        Ok(render(
            SynthScene::StarField,
            self.dims,
            effective,
            self.field_seed,
            noise_seed,
        ))
    }

    fn abort_exposure(&mut self) -> DriverResult<()> {
        if self.pending.take().is_some() {
            debug!("{} exposure aborted", self.label);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.pending = None;
    }

    fn dimensions(&self) -> (usize, usize) {
        self.dims
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// How actuator steps map to guide-star motion on the guide camera.
///
/// The same mapping, inverted, is what calibration training has to
/// discover.
#[derive(Debug, Clone, Copy)]
pub struct SimGeometry {
    pub axes_swapped: bool,
    pub invert_x: bool,
    pub invert_y: bool,
    /// Star motion in pixels per actuator step.
    pub px_per_step: f64,
}

impl Default for SimGeometry {
    fn default() -> Self {
        Self {
            axes_swapped: false,
            invert_x: false,
            invert_y: false,
            px_per_step: 1.0 / 6.0,
        }
    }
}

/// Which correction channel a [`SimActuator`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimChannel {
    /// The tip-tilt element.
    Fast,
    /// The mount's guide port.
    Mount,
}

/// Shared optical state coupling the simulated actuators to
/// [`SimGuideCamera`]. Both the tilt element and the mount move the same
/// star, each through its own geometry.
pub struct SimRig {
    fast: SimGeometry,
    mount: SimGeometry,
    fast_pos: (i32, i32),
    mount_pos: (i32, i32),
    /// Star offset from frame centre with both channels at zero. Tests
    /// drive this directly to simulate drift.
    pub drift: (f64, f64),
    /// Every step command each channel accepted, in order.
    pub fast_steps: Vec<(Axis, i32)>,
    pub mount_steps: Vec<(Axis, i32)>,
    pub centre_count: usize,
}

impl SimRig {
    pub fn new(fast: SimGeometry, mount: SimGeometry) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            fast,
            mount,
            fast_pos: (0, 0),
            mount_pos: (0, 0),
            drift: (0.0, 0.0),
            fast_steps: Vec::new(),
            mount_steps: Vec::new(),
            centre_count: 0,
        }))
    }

    /// Rig with only the fast channel coupled; mount steps land on a
    /// default geometry.
    pub fn with_fast(fast: SimGeometry) -> Arc<Mutex<Self>> {
        Self::new(fast, SimGeometry::default())
    }

    /// Current star offset from frame centre, in pixels.
    pub fn star_offset(&self) -> (f64, f64) {
        let (fx, fy) = project(self.fast, self.fast_pos);
        let (mx, my) = project(self.mount, self.mount_pos);
        (self.drift.0 + fx + mx, self.drift.1 + fy + my)
    }

    fn apply_steps(&mut self, channel: SimChannel, axis: Axis, count: i32) {
        let (pos, log) = match channel {
            SimChannel::Fast => (&mut self.fast_pos, &mut self.fast_steps),
            SimChannel::Mount => (&mut self.mount_pos, &mut self.mount_steps),
        };
        match axis {
            Axis::X => pos.0 += count,
            Axis::Y => pos.1 += count,
        }
        log.push((axis, count));
    }
}

/// Star displacement a channel at `pos` produces under its geometry.
fn project(g: SimGeometry, pos: (i32, i32)) -> (f64, f64) {
    let sign = |invert: bool| if invert { -1.0 } else { 1.0 };
    let from_x = pos.0 as f64 * g.px_per_step * sign(g.invert_x);
    let from_y = pos.1 as f64 * g.px_per_step * sign(g.invert_y);
    if g.axes_swapped {
        (from_y, from_x)
    } else {
        (from_x, from_y)
    }
}

/// Simulated guide camera. Renders a single star at the offset the
/// [`SimRig`] reports.
pub struct SimGuideCamera {
    label: String,
    dims: (usize, usize),
    rig: Arc<Mutex<SimRig>>,
    instant_ready: bool,
    connected: bool,
    frame_index: u64,
    pending: Option<Pending>,
}

impl SimGuideCamera {
    pub fn new(label: impl Into<String>, dims: (usize, usize), rig: Arc<Mutex<SimRig>>) -> Self {
        Self {
            label: label.into(),
            dims,
            rig,
            instant_ready: false,
            connected: false,
            frame_index: 0,
            pending: None,
        }
    }

    pub fn with_instant_ready(mut self, instant: bool) -> Self {
        self.instant_ready = instant;
        self
    }
}

impl CameraDriver for SimGuideCamera {
    fn connect(&mut self) -> DriverResult<bool> {
        self.connected = true;
        Ok(true)
    }

    fn start_exposure(&mut self, seconds: f64, is_light: bool) -> DriverResult<()> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        if self.pending.is_some() {
            return Err(DriverError::Rejected("exposure already in progress".into()));
        }
        self.pending = Some(Pending {
            started: Instant::now(),
            exptime_s: seconds,
            is_light,
        });
        Ok(())
    }

    fn is_ready(&mut self) -> DriverResult<bool> {
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| DriverError::Rejected("no exposure in progress".into()))?;
        Ok(self.instant_ready || pending.started.elapsed().as_secs_f64() >= pending.exptime_s)
    }

    fn read_pixels(&mut self) -> DriverResult<Array2<u16>> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| DriverError::Rejected("no exposure to read".into()))?;
        let (height, width) = self.dims;
        let (off_x, off_y) = self.rig.lock().unwrap().star_offset();
        let centre = (
            (width as f64 - 1.0) / 2.0 + off_x,
            (height as f64 - 1.0) / 2.0 + off_y,
        );
        let effective = if pending.is_light {
            pending.exptime_s
        } else {
            0.0
        };
        let noise_seed = self.frame_index;
        self.frame_index += 1;
        Ok(render(
            SynthScene::GuideStar {
                centre: Some(centre),
            },
            self.dims,
            effective,
            0,
            noise_seed,
        ))
    }

    fn abort_exposure(&mut self) -> DriverResult<()> {
        self.pending = None;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.pending = None;
    }

    fn dimensions(&self) -> (usize, usize) {
        self.dims
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Simulated stepping actuator, coupled to the guide camera via
/// [`SimRig`].
pub struct SimActuator {
    label: String,
    rig: Arc<Mutex<SimRig>>,
    channel: SimChannel,
    connected: bool,
    /// Report `Limit` on this step call (0-based), once, without moving.
    limit_on_call: Option<usize>,
    calls: usize,
}

impl SimActuator {
    pub fn new(label: impl Into<String>, rig: Arc<Mutex<SimRig>>, channel: SimChannel) -> Self {
        Self {
            label: label.into(),
            rig,
            channel,
            connected: false,
            limit_on_call: None,
            calls: 0,
        }
    }

    pub fn with_limit_on_call(mut self, call: usize) -> Self {
        self.limit_on_call = Some(call);
        self
    }
}

impl ActuatorDriver for SimActuator {
    fn connect(&mut self) -> DriverResult<bool> {
        self.connected = true;
        Ok(true)
    }

    fn step(&mut self, axis: Axis, count: i32) -> DriverResult<StepResult> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        let call = self.calls;
        self.calls += 1;
        if self.limit_on_call == Some(call) {
            debug!("{} scripted limit on call {call}", self.label);
            return Ok(StepResult::Limit);
        }
        self.rig.lock().unwrap().apply_steps(self.channel, axis, count);
        Ok(StepResult::Ack)
    }

    fn centre(&mut self) -> DriverResult<bool> {
        if self.channel == SimChannel::Mount {
            return Ok(true);
        }
        let mut rig = self.rig.lock().unwrap();
        rig.fast_pos = (0, 0);
        rig.centre_count += 1;
        Ok(true)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Actuator that records every command and always acknowledges. Stands
/// in for the mount's guide port in the simulated rig.
pub struct RecordingActuator {
    label: String,
    log: Arc<Mutex<Vec<(Axis, i32)>>>,
}

impl RecordingActuator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log_handle(&self) -> Arc<Mutex<Vec<(Axis, i32)>>> {
        Arc::clone(&self.log)
    }
}

impl ActuatorDriver for RecordingActuator {
    fn connect(&mut self) -> DriverResult<bool> {
        Ok(true)
    }

    fn step(&mut self, axis: Axis, count: i32) -> DriverResult<StepResult> {
        self.log.lock().unwrap().push((axis, count));
        Ok(StepResult::Ack)
    }

    fn centre(&mut self) -> DriverResult<bool> {
        Ok(true)
    }

    fn disconnect(&mut self) {}

    fn name(&self) -> &str {
        &self.label
    }
}

/// Simulated mount with a settable pointing.
#[derive(Debug)]
pub struct SimMount {
    ra: f64,
    dec: f64,
    tracking: bool,
}

impl SimMount {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self {
            ra,
            dec,
            tracking: true,
        }
    }
}

impl SimMount {
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }
}

impl MountDriver for SimMount {
    fn position(&mut self) -> DriverResult<(f64, f64)> {
        Ok((self.ra, self.dec))
    }

    fn slew_to(&mut self, ra: f64, dec: f64) -> DriverResult<()> {
        self.ra = ra;
        self.dec = dec;
        Ok(())
    }

    fn set_tracking(&mut self, on: bool) -> DriverResult<()> {
        self.tracking = on;
        Ok(())
    }
}

/// Display channel that records notifications instead of sending them.
#[derive(Default)]
pub struct RecordingDisplay {
    notes: Arc<Mutex<Vec<String>>>,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.notes)
    }
}

impl DisplayChannel for RecordingDisplay {
    fn notify(&mut self, command: &str, params: &[(&str, String)]) -> bool {
        let mut line = command.to_string();
        for (key, value) in params {
            line.push_str(&format!(" {key}={value}"));
        }
        self.notes.lock().unwrap().push(line);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shared::image_proc::locate_star;

    #[test]
    fn sim_camera_requires_connect() {
        let mut cam = SimCamera::new("main", (16, 16), 1);
        assert!(matches!(
            cam.start_exposure(1.0, true),
            Err(DriverError::NotConnected)
        ));
        assert!(cam.connect().unwrap());
        cam.start_exposure(1.0, true).unwrap();
    }

    #[test]
    fn scripted_connect_refusals_run_out() {
        let mut cam = SimCamera::new("main", (16, 16), 1).refusing_connects(2);
        assert!(!cam.connect().unwrap());
        assert!(!cam.connect().unwrap());
        assert!(cam.connect().unwrap());
    }

    #[test]
    fn actuator_steps_move_the_rendered_star() {
        let rig = SimRig::with_fast(SimGeometry {
            px_per_step: 0.5,
            ..SimGeometry::default()
        });
        let mut actuator = SimActuator::new("tilt", Arc::clone(&rig), SimChannel::Fast);
        let mut cam =
            SimGuideCamera::new("guide", (64, 64), Arc::clone(&rig)).with_instant_ready(true);
        actuator.connect().unwrap();
        cam.connect().unwrap();

        actuator.step(Axis::X, 8).unwrap();
        cam.start_exposure(2.0, true).unwrap();
        assert!(cam.is_ready().unwrap());
        let pixels = cam.read_pixels().unwrap();
        let frame = pixels.mapv(f64::from);
        let position = locate_star(&frame.view(), 24);
        // 8 steps at 0.5 px/step puts the star 4 px right of centre.
        assert_relative_eq!(position.x, 31.5 + 4.0, epsilon = 0.5);
        assert_relative_eq!(position.y, 31.5, epsilon = 0.5);
    }

    #[test]
    fn swapped_geometry_routes_x_steps_to_y() {
        let rig = SimRig::with_fast(SimGeometry {
            axes_swapped: true,
            px_per_step: 0.5,
            ..SimGeometry::default()
        });
        let mut actuator = SimActuator::new("tilt", Arc::clone(&rig), SimChannel::Fast);
        actuator.connect().unwrap();
        actuator.step(Axis::X, 6).unwrap();
        let (off_x, off_y) = rig.lock().unwrap().star_offset();
        assert_relative_eq!(off_x, 0.0);
        assert_relative_eq!(off_y, 3.0);
    }

    #[test]
    fn centre_rewinds_fast_steps_but_not_mount_steps() {
        let rig = SimRig::new(
            SimGeometry::default(),
            SimGeometry {
                px_per_step: 0.05,
                ..SimGeometry::default()
            },
        );
        let mut fast = SimActuator::new("tilt", Arc::clone(&rig), SimChannel::Fast);
        let mut mount = SimActuator::new("mount", Arc::clone(&rig), SimChannel::Mount);
        fast.connect().unwrap();
        mount.connect().unwrap();

        fast.step(Axis::Y, 60).unwrap();
        mount.step(Axis::Y, 20).unwrap();
        assert_relative_eq!(rig.lock().unwrap().star_offset().1, 11.0, epsilon = 1e-9);

        fast.centre().unwrap();
        assert_relative_eq!(rig.lock().unwrap().star_offset().1, 1.0, epsilon = 1e-9);
        assert_eq!(rig.lock().unwrap().centre_count, 1);

        // The mount's guide port has no centre position.
        mount.centre().unwrap();
        assert_relative_eq!(rig.lock().unwrap().star_offset().1, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn mount_tracks_pointing_and_tracking_state() {
        let mut mount = SimMount::new(180.0, -30.0);
        assert!(mount.is_tracking());
        mount.slew_to(181.0, -29.5).unwrap();
        assert_eq!(mount.position().unwrap(), (181.0, -29.5));
        mount.set_tracking(false).unwrap();
        assert!(!mount.is_tracking());
    }
}
