//! Training runs against simulated rig geometries: the calibrator has
//! to rediscover whatever swap, inversion and scale the rig was built
//! with, purely from guide frames.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use approx::assert_relative_eq;
use crossbeam_channel::Receiver;
use nalgebra::Vector2;

use hardware::sim::{SimActuator, SimChannel, SimGeometry, SimGuideCamera, SimRig};
use sequencer::calibrator::{ActuatorCalibrator, CalibratorError, CalibratorState};
use sequencer::config::{GuidingConfig, SessionConfig};
use sequencer::guiding::{
    AxisSpace, GuideCalibrations, GuideCorrection, GuideLoop, GuideLoopConfig,
};
use sequencer::session::{CameraRole, CameraSession, SessionEvent, SessionSettings};
use shared::drivers::Axis;
use shared::frame::ExposureRequest;
use shared::image_proc::locate_star;

struct TrainingBench {
    session: CameraSession,
    guide_loop: GuideLoop,
    calibrations: Arc<RwLock<GuideCalibrations>>,
    config: GuidingConfig,
}

fn training_config() -> GuidingConfig {
    let mut config = GuidingConfig::default();
    // Simulated moves land instantly; keep the waits short. Exposures
    // are instant too, so a long exptime costs nothing and holds the
    // centroid noise to hundredths of a pixel.
    config.exptime_s = 2.0;
    config.settle_s = 0.05;
    config.min_step_interval_s = 0.0;
    config
}

fn training_bench(fast: SimGeometry, mount: SimGeometry) -> (TrainingBench, Arc<Mutex<SimRig>>) {
    let rig = SimRig::new(fast, mount);
    let session = CameraSession::spawn(
        "guide-camera",
        Box::new(SimGuideCamera::new("guide", (64, 64), Arc::clone(&rig)).with_instant_ready(true)),
        CameraRole::Guide,
        SessionSettings::from(&SessionConfig::default()),
    );
    let calibrations = Arc::new(RwLock::new(GuideCalibrations::default()));
    let config = training_config();
    let guide_loop = GuideLoop::spawn(
        Box::new(SimActuator::new("tilt", Arc::clone(&rig), SimChannel::Fast)),
        Box::new(SimActuator::new(
            "mount-port",
            Arc::clone(&rig),
            SimChannel::Mount,
        )),
        Arc::clone(&calibrations),
        GuideLoopConfig::from(&config),
    );
    (
        TrainingBench {
            session,
            guide_loop,
            calibrations,
            config,
        },
        rig,
    )
}

fn measure(session: &CameraSession, events: &Receiver<SessionEvent>) -> Vector2<f64> {
    session
        .request_exposure(ExposureRequest::new(2.0, true))
        .unwrap();
    match events.recv_timeout(Duration::from_secs(5)).unwrap() {
        SessionEvent::Frame(frame) => locate_star(&frame.pixels_f64().view(), 24),
        SessionEvent::Unavailable(reason) => panic!("guide camera unavailable: {reason}"),
    }
}

#[test]
fn training_discovers_swap_inversion_and_scale() {
    let _ = env_logger::builder().is_test(true).try_init();
    // Device X drives image -y, device Y drives image +x, 4 steps/px.
    let fast_geometry = SimGeometry {
        axes_swapped: true,
        invert_x: true,
        invert_y: false,
        px_per_step: 0.25,
    };
    let mount_geometry = SimGeometry {
        px_per_step: 0.1,
        ..SimGeometry::default()
    };
    let (bench, _rig) = training_bench(fast_geometry, mount_geometry);

    let mut calibrator = ActuatorCalibrator::new(
        &bench.session,
        &bench.guide_loop,
        Arc::clone(&bench.calibrations),
        bench.config.clone(),
    );
    let trained = calibrator.run().expect("training should succeed");
    assert_eq!(calibrator.state(), CalibratorState::Trained);

    assert!(trained.fast.axes_swapped);
    assert!(trained.fast.invert_x);
    assert!(!trained.fast.invert_y);
    assert_relative_eq!(trained.fast.steps_per_pixel, 4.0, max_relative = 0.1);

    assert!(!trained.mount.axes_swapped);
    assert!(!trained.mount.invert_x);
    assert!(!trained.mount.invert_y);
    assert_relative_eq!(trained.mount.steps_per_pixel, 10.0, max_relative = 0.1);

    // The trained values are what the running loop now sees.
    assert_eq!(*bench.calibrations.read().unwrap(), trained);
}

#[test]
fn trained_loop_pulls_a_drifted_star_back() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fast_geometry = SimGeometry {
        invert_y: true,
        px_per_step: 0.5,
        ..SimGeometry::default()
    };
    let mount_geometry = SimGeometry {
        px_per_step: 0.1,
        ..SimGeometry::default()
    };
    let (bench, rig) = training_bench(fast_geometry, mount_geometry);
    let events = bench.session.events();

    {
        let mut calibrator = ActuatorCalibrator::new(
            &bench.session,
            &bench.guide_loop,
            Arc::clone(&bench.calibrations),
            bench.config.clone(),
        );
        calibrator.run().expect("training should succeed");
    }

    let lock = measure(&bench.session, &events);
    rig.lock().unwrap().drift = (1.8, -2.4);
    let drifted = measure(&bench.session, &events);
    let error = drifted - lock;
    assert!(error.norm() > 2.0, "drift should be visible, got {error:?}");

    // One closed-loop correction under the trained mapping.
    assert!(bench.guide_loop.send(GuideCorrection::Move {
        space: AxisSpace::Fast,
        dx: -error.x,
        dy: -error.y,
    }));
    std::thread::sleep(Duration::from_millis(150));

    let corrected = measure(&bench.session, &events);
    let residual = (corrected - lock).norm();
    assert!(
        residual < 1.0,
        "star should return near the lock, residual {residual:.2} px"
    );
}

#[test]
fn unresponsive_axis_fails_and_restores_calibrations() {
    let _ = env_logger::builder().is_test(true).try_init();
    // Star motion far below the training noise floor.
    let numb_geometry = SimGeometry {
        px_per_step: 0.001,
        ..SimGeometry::default()
    };
    let (bench, _rig) = training_bench(numb_geometry, SimGeometry::default());

    let mut calibrator = ActuatorCalibrator::new(
        &bench.session,
        &bench.guide_loop,
        Arc::clone(&bench.calibrations),
        bench.config.clone(),
    );
    let err = calibrator.run().expect_err("training should fail");
    match err {
        CalibratorError::NoResponse { space, axis } => {
            assert_eq!(space, AxisSpace::Fast);
            assert_eq!(axis, Axis::X);
        }
        other => panic!("unexpected training failure: {other}"),
    }
    assert_eq!(calibrator.state(), CalibratorState::Failed);

    // The provisional identity mapping must not leak out.
    assert_eq!(
        *bench.calibrations.read().unwrap(),
        GuideCalibrations::default()
    );
}
