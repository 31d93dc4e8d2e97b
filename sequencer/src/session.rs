//! Background camera session.
//!
//! Each session owns one camera driver on a dedicated thread; the driver
//! is never touched from anywhere else. The foreground side requests
//! exposures asynchronously and receives frames (or an unavailability
//! notice) on an event channel. One exposure may be in flight at a time,
//! enforced by an atomic slot, so frames never queue up unboundedly.
//!
//! The worker waits for work in at most one second slices, so shutdown,
//! disable and abort are all noticed promptly. Cancelling an in-flight
//! exposure issues a device-level abort rather than discarding the
//! result, freeing the camera immediately.
//!
//! When the device refuses to connect after the configured retries the
//! session falls back to rendering synthetic frames, so every consumer
//! upstream keeps working headless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use shared::drivers::CameraDriver;
use shared::frame::{CapturedFrame, ExposureRequest};
use shared::image_proc::synth::{render, SynthScene};

/// Longest the worker sleeps without rechecking control flags.
const ARM_POLL: Duration = Duration::from_secs(1);

/// Field seed for fallback synthetic frames.
const SYNTH_FIELD_SEED: u64 = 20_260_314;

/// What the session is driving; selects readiness poll rate and the
/// synthetic scene used when the device is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraRole {
    Main,
    Guide,
}

impl CameraRole {
    fn ready_poll(self) -> Duration {
        match self {
            CameraRole::Main => Duration::from_secs(1),
            CameraRole::Guide => Duration::from_millis(100),
        }
    }

    fn scene(self) -> SynthScene {
        match self {
            CameraRole::Main => SynthScene::StarField,
            CameraRole::Guide => SynthScene::GuideStar { centre: None },
        }
    }
}

/// Connect retry behaviour, from [`crate::config::SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_attempts: u32,
    pub connect_retry: Duration,
}

impl From<&crate::config::SessionConfig> for SessionSettings {
    fn from(config: &crate::config::SessionConfig) -> Self {
        Self {
            connect_attempts: config.connect_attempts.max(1),
            connect_retry: Duration::from_secs_f64(config.connect_retry_s.max(0.0)),
        }
    }
}

/// Delivered on the session's event channel.
#[derive(Debug)]
pub enum SessionEvent {
    Frame(CapturedFrame),
    /// The driver failed; the device has been disconnected and the next
    /// request will retry from scratch.
    Unavailable(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The session gate is closed; no exposures may start.
    #[error("camera session disabled")]
    Disabled,

    /// The single in-flight exposure slot is taken.
    #[error("exposure already in flight")]
    Busy,

    /// The worker thread is gone.
    #[error("camera session shut down")]
    ShutDown,
}

struct Shared {
    enabled: AtomicBool,
    cancel: AtomicBool,
    shutdown: AtomicBool,
    in_flight: AtomicBool,
}

/// Foreground handle to one camera thread.
pub struct CameraSession {
    label: String,
    shared: Arc<Shared>,
    requests: Option<Sender<ExposureRequest>>,
    events: Receiver<SessionEvent>,
    dimensions: (usize, usize),
    thread: Option<JoinHandle<()>>,
}

impl CameraSession {
    pub fn spawn(
        label: impl Into<String>,
        driver: Box<dyn CameraDriver>,
        role: CameraRole,
        settings: SessionSettings,
    ) -> Self {
        let label = label.into();
        let dimensions = driver.dimensions();
        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        });
        let (request_tx, request_rx) = bounded::<ExposureRequest>(1);
        let (event_tx, event_rx) = bounded::<SessionEvent>(2);

        let worker = Worker {
            label: label.clone(),
            driver,
            role,
            settings,
            shared: Arc::clone(&shared),
            connected: false,
            synthetic: false,
            synth_index: 0,
        };
        let thread = std::thread::spawn(move || worker.run(request_rx, event_tx));

        Self {
            label,
            shared,
            requests: Some(request_tx),
            events: event_rx,
            dimensions,
            thread: Some(thread),
        }
    }

    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn dimensions(&self) -> (usize, usize) {
        self.dimensions
    }

    /// Permit exposures.
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
    }

    /// Refuse new exposures and abort any outstanding one.
    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Abort the in-flight exposure, if any, without closing the gate.
    /// The device abort frees the camera for the next request.
    pub fn abort_current(&self) {
        if self.shared.in_flight.load(Ordering::SeqCst) {
            self.shared.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Queue one exposure. Returns immediately; the frame arrives later
    /// on [`events`](Self::events).
    pub fn request_exposure(&self, request: ExposureRequest) -> Result<(), SessionError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(SessionError::ShutDown);
        }
        if !self.shared.enabled.load(Ordering::SeqCst) {
            return Err(SessionError::Disabled);
        }
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::Busy);
        }
        // Fresh request, fresh cancel state. Safe because the slot claim
        // above means no other request can be mid-abort.
        self.shared.cancel.store(false, Ordering::SeqCst);
        let sent = match self.requests.as_ref() {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.in_flight.store(false, Ordering::SeqCst);
            return Err(SessionError::ShutDown);
        }
        Ok(())
    }

    /// The event channel. Clone freely; events are consumed by whoever
    /// receives first, and the controller is the only intended reader.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cancel.store(true, Ordering::SeqCst);
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum ExposeEnd {
    Cancelled,
    Failed(String),
}

struct Worker {
    label: String,
    driver: Box<dyn CameraDriver>,
    role: CameraRole,
    settings: SessionSettings,
    shared: Arc<Shared>,
    connected: bool,
    synthetic: bool,
    synth_index: u64,
}

impl Worker {
    fn run(mut self, requests: Receiver<ExposureRequest>, events: Sender<SessionEvent>) {
        log::debug!("camera session '{}' started", self.label);
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let request = match requests.recv_timeout(ARM_POLL) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if let Some(event) = self.serve(request) {
                let _ = events.send(event);
            }
            self.shared.in_flight.store(false, Ordering::SeqCst);
        }
        if self.connected {
            self.driver.disconnect();
        }
        log::debug!("camera session '{}' stopped", self.label);
    }

    fn cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst) || self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Handle one exposure request end to end. `None` means the request
    /// was cancelled and nothing is delivered.
    fn serve(&mut self, request: ExposureRequest) -> Option<SessionEvent> {
        if !self.connected && !self.synthetic {
            self.connect_with_retry();
            if self.cancelled() {
                return None;
            }
        }

        // The capture timestamp is the start of the exposure, not the
        // moment of delivery.
        let captured_at = Utc::now();

        if self.synthetic {
            return self
                .synth_capture(&request)
                .map(|pixels| {
                    SessionEvent::Frame(CapturedFrame {
                        pixels,
                        captured_at,
                        exptime_s: request.exptime_s,
                        simulated: true,
                    })
                });
        }

        match self.real_capture(&request) {
            Ok(pixels) => Some(SessionEvent::Frame(CapturedFrame {
                pixels,
                captured_at,
                exptime_s: request.exptime_s,
                simulated: false,
            })),
            Err(ExposeEnd::Cancelled) => None,
            Err(ExposeEnd::Failed(reason)) => {
                log::error!("camera '{}' unavailable: {reason}", self.label);
                self.driver.disconnect();
                self.connected = false;
                Some(SessionEvent::Unavailable(reason))
            }
        }
    }

    fn connect_with_retry(&mut self) {
        for attempt in 1..=self.settings.connect_attempts {
            match self.driver.connect() {
                Ok(true) => {
                    log::info!("camera '{}' connected", self.label);
                    self.connected = true;
                    self.flush_first_frame();
                    return;
                }
                Ok(false) => {
                    log::warn!(
                        "camera '{}' refused connection (attempt {attempt}/{})",
                        self.label,
                        self.settings.connect_attempts
                    );
                }
                Err(e) => {
                    log::warn!(
                        "camera '{}' connect failed (attempt {attempt}/{}): {e}",
                        self.label,
                        self.settings.connect_attempts
                    );
                }
            }
            if attempt < self.settings.connect_attempts {
                if !self.sleep_watching_cancel(self.settings.connect_retry) {
                    return;
                }
            }
        }
        log::error!(
            "camera '{}' unreachable after {} attempts, switching to synthetic frames",
            self.label,
            self.settings.connect_attempts
        );
        self.synthetic = true;
    }

    /// Some devices deliver a stale buffer as their first frame after
    /// connecting. Take and discard a minimal exposure.
    fn flush_first_frame(&mut self) {
        if let Err(e) = self.try_flush() {
            log::debug!("camera '{}' first-frame flush failed: {e}", self.label);
        }
    }

    fn try_flush(&mut self) -> shared::drivers::DriverResult<()> {
        self.driver.start_exposure(0.0, false)?;
        while !self.driver.is_ready()? {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.driver.read_pixels()?;
        Ok(())
    }

    fn real_capture(&mut self, request: &ExposureRequest) -> Result<ndarray::Array2<u16>, ExposeEnd> {
        if self.cancelled() {
            return Err(ExposeEnd::Cancelled);
        }
        self.driver
            .start_exposure(request.exptime_s, request.is_light)
            .map_err(|e| ExposeEnd::Failed(e.to_string()))?;

        let poll = self.role.ready_poll();
        loop {
            if self.cancelled() {
                if let Err(e) = self.driver.abort_exposure() {
                    log::warn!("camera '{}' abort failed: {e}", self.label);
                }
                return Err(ExposeEnd::Cancelled);
            }
            match self.driver.is_ready() {
                Ok(true) => break,
                Ok(false) => std::thread::sleep(poll),
                Err(e) => return Err(ExposeEnd::Failed(e.to_string())),
            }
        }
        self.driver
            .read_pixels()
            .map_err(|e| ExposeEnd::Failed(e.to_string()))
    }

    fn synth_capture(&mut self, request: &ExposureRequest) -> Option<ndarray::Array2<u16>> {
        // Pace like a real camera so continuous sequences do not spin.
        if !self.sleep_watching_cancel(Duration::from_secs_f64(request.exptime_s)) {
            return None;
        }
        let effective = if request.is_light {
            request.exptime_s
        } else {
            0.0
        };
        let noise_seed = SYNTH_FIELD_SEED.wrapping_add(self.synth_index);
        self.synth_index += 1;
        Some(render(
            self.role.scene(),
            self.driver.dimensions(),
            effective,
            SYNTH_FIELD_SEED,
            noise_seed,
        ))
    }

    /// Sleep `total` in short slices. Returns false if cancelled.
    fn sleep_watching_cancel(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(ARM_POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::sim::SimCamera;

    fn fast_settings() -> SessionSettings {
        SessionSettings {
            connect_attempts: 2,
            connect_retry: Duration::from_millis(10),
        }
    }

    fn spawn_sim(camera: SimCamera) -> CameraSession {
        CameraSession::spawn(
            "test-camera",
            Box::new(camera),
            CameraRole::Guide,
            fast_settings(),
        )
    }

    #[test]
    fn one_request_yields_exactly_one_frame() {
        let session = spawn_sim(SimCamera::new("sim", (16, 16), 7).with_instant_ready(true));
        session.enable();
        let events = session.events();

        session
            .request_exposure(ExposureRequest::new(0.0, true))
            .unwrap();
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            SessionEvent::Frame(frame) => {
                assert_eq!(frame.dimensions(), (16, 16));
                assert!(!frame.simulated);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn disabled_session_rejects_requests() {
        let session = spawn_sim(SimCamera::new("sim", (16, 16), 7));
        let err = session
            .request_exposure(ExposureRequest::new(1.0, true))
            .unwrap_err();
        assert_eq!(err, SessionError::Disabled);
    }

    #[test]
    fn in_flight_slot_rejects_second_request() {
        let session = spawn_sim(SimCamera::new("sim", (16, 16), 7));
        session.enable();
        session
            .request_exposure(ExposureRequest::new(5.0, true))
            .unwrap();
        let err = session
            .request_exposure(ExposureRequest::new(1.0, true))
            .unwrap_err();
        assert_eq!(err, SessionError::Busy);
    }

    #[test]
    fn disable_aborts_in_flight_exposure_and_session_recovers() {
        let session = spawn_sim(SimCamera::new("sim", (16, 16), 7));
        session.enable();
        let events = session.events();

        session
            .request_exposure(ExposureRequest::new(30.0, true))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        session.disable();

        // The aborted exposure delivers nothing.
        assert!(events.recv_timeout(Duration::from_millis(500)).is_err());

        session.enable();
        session
            .request_exposure(ExposureRequest::new(0.0, true))
            .unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            SessionEvent::Frame(_)
        ));
    }

    #[test]
    fn connect_failure_falls_back_to_synthetic_frames() {
        let session = spawn_sim(
            SimCamera::new("sim", (16, 16), 7)
                .with_instant_ready(true)
                .refusing_connects(10),
        );
        session.enable();
        let events = session.events();

        session
            .request_exposure(ExposureRequest::new(0.0, true))
            .unwrap();
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            SessionEvent::Frame(frame) => assert!(frame.simulated),
            other => panic!("expected frame, got {other:?}"),
        }
    }
}
