//! Device driver contracts.
//!
//! Every driver handle has thread affinity: it is created on one thread (or
//! moved into it at spawn) and used exclusively from that thread for its
//! whole life. The traits are `Send` so handles can be moved into their
//! owning thread, but nothing here is `Sync` and calls must never be issued
//! from two threads. The `sequencer` crate enforces this by moving each
//! boxed driver into the thread that serializes access to it.

use ndarray::Array2;
use thiserror::Error;

/// Errors surfaced by device drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Operation attempted on a device that is not connected.
    #[error("device not connected")]
    NotConnected,

    /// The device replied but refused the command.
    #[error("device rejected command: {0}")]
    Rejected(String),

    /// Transport failure (serial, USB, vendor library).
    #[error("device io: {0}")]
    Io(#[from] std::io::Error),

    /// Anything the driver cannot classify further.
    #[error("{0}")]
    Other(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// A camera device.
///
/// One owning thread only; the camera session serializes every call.
pub trait CameraDriver: Send {
    /// Open the device. `Ok(false)` means the device refused without an
    /// underlying transport error; callers treat both the same for retry
    /// purposes.
    fn connect(&mut self) -> DriverResult<bool>;

    /// Begin an exposure of `seconds`, with the shutter open when
    /// `is_light`. Returns as soon as the device has accepted the command.
    fn start_exposure(&mut self, seconds: f64, is_light: bool) -> DriverResult<()>;

    /// Whether a started exposure has finished and pixels can be read.
    fn is_ready(&mut self) -> DriverResult<bool>;

    /// Fetch the pixels of the completed exposure.
    fn read_pixels(&mut self) -> DriverResult<Array2<u16>>;

    /// Cancel an in-flight exposure at the device level.
    fn abort_exposure(&mut self) -> DriverResult<()>;

    /// Close the device. Infallible by contract; drivers log what they must.
    fn disconnect(&mut self);

    /// (height, width) of full frames from this device.
    fn dimensions(&self) -> (usize, usize);

    fn name(&self) -> &str;
}

impl CameraDriver for Box<dyn CameraDriver> {
    fn connect(&mut self) -> DriverResult<bool> {
        (**self).connect()
    }

    fn start_exposure(&mut self, seconds: f64, is_light: bool) -> DriverResult<()> {
        (**self).start_exposure(seconds, is_light)
    }

    fn is_ready(&mut self) -> DriverResult<bool> {
        (**self).is_ready()
    }

    fn read_pixels(&mut self) -> DriverResult<Array2<u16>> {
        (**self).read_pixels()
    }

    fn abort_exposure(&mut self) -> DriverResult<()> {
        (**self).abort_exposure()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn dimensions(&self) -> (usize, usize) {
        (**self).dimensions()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Command axes of a stepping actuator, in the device's own frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

/// Outcome of a step command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Steps applied.
    Ack,
    /// The device hit (or would exceed) its travel limit; the command was
    /// not fully applied.
    Limit,
    /// The device replied with an error.
    Fail,
}

/// A discrete-stepping corrector: the fast tip-tilt device, or the mount's
/// guide-rate input. One owning thread only.
pub trait ActuatorDriver: Send {
    fn connect(&mut self) -> DriverResult<bool>;

    /// Apply `count` steps along `axis`; the sign selects direction.
    fn step(&mut self, axis: Axis, count: i32) -> DriverResult<StepResult>;

    /// Return the device to its centre position.
    fn centre(&mut self) -> DriverResult<bool>;

    fn disconnect(&mut self);

    fn name(&self) -> &str;
}

/// Pointing-level mount control, distinct from its guide-rate stepping
/// input (which is an [`ActuatorDriver`]).
pub trait MountDriver: Send {
    /// Current (RA, Dec) in degrees.
    fn position(&mut self) -> DriverResult<(f64, f64)>;

    fn slew_to(&mut self, ra: f64, dec: f64) -> DriverResult<()>;

    fn set_tracking(&mut self, on: bool) -> DriverResult<()>;
}

/// Best-effort notification channel to an external display tool.
///
/// Returns false when nothing is listening; that is never an error and
/// callers log it at debug level at most.
pub trait DisplayChannel: Send {
    fn notify(&mut self, command: &str, params: &[(&str, String)]) -> bool;
}

/// The always-absent display. Logs one debug line per notification.
#[derive(Debug, Default)]
pub struct NoDisplay;

impl DisplayChannel for NoDisplay {
    fn notify(&mut self, command: &str, _params: &[(&str, String)]) -> bool {
        log::debug!("no display connection, dropping '{command}' notification");
        false
    }
}
