//! Starlight Xpress AO-unit serial driver.
//!
//! The unit is a tip-tilt corrector with a pass-through guide port for the
//! mount, both driven over one serial line with single-character framed
//! commands:
//!
//! - `X` handshake on connect, answered with `Y`
//! - `G<dir><count>` steps the tilt element; answered with `G`, or `L` at
//!   the travel limit
//! - `M<dir><count>` relays guide pulses to the mount; answered with `M`
//! - `K` recentres the tilt element; answered with `K`
//!
//! `<dir>` is one of `N`/`S` (device Y) or `T`/`W` (device X) and
//! `<count>` is a zero-padded five digit step count. Large moves are sent
//! as a series of short commands so the unit stays responsive between
//! chunks.
//!
//! The tilt element has finite throw. On top of the unit's own `L` reply
//! the driver keeps a per-axis running count and reports
//! [`StepResult::Limit`] before commanding a move that would pass the
//! software budget, so the correction loop can recentre and hand the
//! accumulated offset to the mount.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, warn};

use shared::drivers::{ActuatorDriver, Axis, DriverError, DriverResult, StepResult};

/// Serial line speed of the AO unit.
const DEFAULT_BAUD: u32 = 9_600;

/// Reply timeout. Long: the unit answers only after it finishes stepping.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest step count sent in one command.
const MAX_CHUNK: i32 = 10;

/// Default software travel budget per axis, in steps from centre.
const DEFAULT_STEP_BUDGET: i32 = 1_000;

/// One serial connection to the unit, shared by the tilt channel and the
/// mount relay.
struct TiltLink {
    path: String,
    baud: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl TiltLink {
    fn connect(&mut self) -> DriverResult<bool> {
        if self.port.is_some() {
            return Ok(true);
        }
        let mut port = serialport::new(&self.path, self.baud)
            .timeout(self.timeout)
            .open()
            .map_err(|e| DriverError::Other(format!("open {}: {e}", self.path)))?;
        port.write_all(b"X")?;
        let reply = read_reply(&mut port)?;
        if reply != b'Y' {
            return Ok(false);
        }
        self.port = Some(port);
        Ok(true)
    }

    /// Send one command and return the unit's single-byte reply.
    fn transact(&mut self, command: &str) -> DriverResult<u8> {
        let port = self.port.as_mut().ok_or(DriverError::NotConnected)?;
        port.write_all(command.as_bytes())?;
        read_reply(port)
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            info!("closed AO unit at {}", self.path);
        }
    }
}

fn read_reply(port: &mut Box<dyn SerialPort>) -> DriverResult<u8> {
    let mut buf = [0u8; 1];
    port.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// One command channel of the AO unit. [`SerialTilt::open`] yields the
/// tilt channel; [`SerialTilt::mount_relay`] a second handle for the
/// mount's guide port, sharing the same serial line.
pub struct SerialTilt {
    link: Arc<Mutex<TiltLink>>,
    label: String,
    prefix: char,
    /// Software travel budget, `None` for the mount relay.
    budget: Option<i32>,
    net_x: i32,
    net_y: i32,
}

impl SerialTilt {
    pub fn open(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            link: Arc::new(Mutex::new(TiltLink {
                path,
                baud: DEFAULT_BAUD,
                timeout: DEFAULT_TIMEOUT,
                port: None,
            })),
            label: "ao-tilt".to_string(),
            prefix: 'G',
            budget: Some(DEFAULT_STEP_BUDGET),
            net_x: 0,
            net_y: 0,
        }
    }

    pub fn with_baud(self, baud: u32) -> Self {
        self.link.lock().unwrap().baud = baud;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.link.lock().unwrap().timeout = timeout;
        self
    }

    pub fn with_step_budget(mut self, budget: i32) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Handle for the mount's guide port on the same serial line. The
    /// relay has no travel of its own, so no budget and no recentre.
    pub fn mount_relay(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            label: "ao-mount-relay".to_string(),
            prefix: 'M',
            budget: None,
            net_x: 0,
            net_y: 0,
        }
    }

    fn net(&mut self, axis: Axis) -> &mut i32 {
        match axis {
            Axis::X => &mut self.net_x,
            Axis::Y => &mut self.net_y,
        }
    }
}

/// Direction character for a signed move along `axis`, in the unit's
/// compass convention: `T`/`W` for device X, `N`/`S` for device Y.
fn direction_char(axis: Axis, positive: bool) -> char {
    match (axis, positive) {
        (Axis::X, true) => 'T',
        (Axis::X, false) => 'W',
        (Axis::Y, true) => 'N',
        (Axis::Y, false) => 'S',
    }
}

fn step_command(prefix: char, dir: char, count: i32) -> String {
    format!("{prefix}{dir}{count:05}")
}

/// Split a total step count into command-sized chunks.
fn chunk_sizes(total: i32, max: i32) -> Vec<i32> {
    let mut remaining = total.abs();
    let mut chunks = Vec::new();
    while remaining > 0 {
        let n = remaining.min(max);
        chunks.push(n);
        remaining -= n;
    }
    chunks
}

impl ActuatorDriver for SerialTilt {
    fn connect(&mut self) -> DriverResult<bool> {
        let ok = self.link.lock().unwrap().connect()?;
        if ok {
            info!("{} connected", self.label);
        } else {
            warn!("{} handshake refused", self.label);
        }
        Ok(ok)
    }

    fn step(&mut self, axis: Axis, count: i32) -> DriverResult<StepResult> {
        if count == 0 {
            return Ok(StepResult::Ack);
        }
        let dir = direction_char(axis, count > 0);
        let signum = count.signum();
        for n in chunk_sizes(count, MAX_CHUNK) {
            if let Some(budget) = self.budget {
                if (*self.net(axis) + signum * n).abs() > budget {
                    debug!("{} {axis:?} step budget reached", self.label);
                    return Ok(StepResult::Limit);
                }
            }
            let command = step_command(self.prefix, dir, n);
            let reply = self.link.lock().unwrap().transact(&command)?;
            if reply == b'L' {
                debug!("{} reported travel limit", self.label);
                return Ok(StepResult::Limit);
            }
            if reply != self.prefix as u8 {
                warn!(
                    "{} unexpected reply {:?} to {command:?}",
                    self.label, reply as char
                );
                return Ok(StepResult::Fail);
            }
            *self.net(axis) += signum * n;
        }
        Ok(StepResult::Ack)
    }

    fn centre(&mut self) -> DriverResult<bool> {
        if self.prefix != 'G' {
            debug!("{} has no centre position", self.label);
            return Ok(true);
        }
        let reply = self.link.lock().unwrap().transact("K")?;
        if reply == b'K' {
            self.net_x = 0;
            self.net_y = 0;
            Ok(true)
        } else {
            warn!("{} centre refused, reply {:?}", self.label, reply as char);
            Ok(false)
        }
    }

    fn disconnect(&mut self) {
        self.link.lock().unwrap().disconnect();
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_chars_follow_compass_convention() {
        assert_eq!(direction_char(Axis::X, true), 'T');
        assert_eq!(direction_char(Axis::X, false), 'W');
        assert_eq!(direction_char(Axis::Y, true), 'N');
        assert_eq!(direction_char(Axis::Y, false), 'S');
    }

    #[test]
    fn commands_are_zero_padded() {
        assert_eq!(step_command('G', 'N', 7), "GN00007");
        assert_eq!(step_command('M', 'W', 12345), "MW12345");
    }

    #[test]
    fn large_moves_are_chunked() {
        assert_eq!(chunk_sizes(25, 10), vec![10, 10, 5]);
        assert_eq!(chunk_sizes(-25, 10), vec![10, 10, 5]);
        // An exact multiple still sends every step.
        assert_eq!(chunk_sizes(20, 10), vec![10, 10]);
        assert_eq!(chunk_sizes(0, 10), Vec::<i32>::new());
    }
}
