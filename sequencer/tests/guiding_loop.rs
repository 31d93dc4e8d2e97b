//! Correction thread behaviour against simulated actuators: backlog
//! coalescing, stop preemption, the dead-band, and the travel-limit
//! handoff to the mount.

use std::sync::{Arc, RwLock};
use std::thread::sleep;
use std::time::Duration;

use hardware::sim::{SimActuator, SimChannel, SimGeometry, SimRig};
use sequencer::guiding::{
    AxisCalibration, AxisSpace, GuideCalibrations, GuideCorrection, GuideLoop, GuideLoopConfig,
};
use shared::drivers::Axis;

fn identity_calibrations() -> Arc<RwLock<GuideCalibrations>> {
    Arc::new(RwLock::new(GuideCalibrations {
        fast: AxisCalibration::identity(),
        mount: AxisCalibration::identity(),
    }))
}

fn fast_move(dx: f64, dy: f64) -> GuideCorrection {
    GuideCorrection::Move {
        space: AxisSpace::Fast,
        dx,
        dy,
    }
}

fn spawn_loop(
    rig: &Arc<std::sync::Mutex<SimRig>>,
    calibrations: &Arc<RwLock<GuideCalibrations>>,
    config: GuideLoopConfig,
) -> GuideLoop {
    GuideLoop::spawn(
        Box::new(SimActuator::new("tilt", Arc::clone(rig), SimChannel::Fast)),
        Box::new(SimActuator::new(
            "mount-port",
            Arc::clone(rig),
            SimChannel::Mount,
        )),
        Arc::clone(calibrations),
        config,
    )
}

#[test]
fn backlog_collapses_to_the_newest_move() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rig = SimRig::new(SimGeometry::default(), SimGeometry::default());
    let calibrations = identity_calibrations();
    let guide_loop = spawn_loop(
        &rig,
        &calibrations,
        GuideLoopConfig {
            min_step_interval: Duration::from_millis(400),
            dead_band_px: 0.1,
        },
    );

    // The first command applies at once and starts the spacing clock.
    assert!(guide_loop.send(fast_move(1.0, 0.0)));
    sleep(Duration::from_millis(150));

    // The worker takes this immediately, then sleeps out the interval.
    assert!(guide_loop.send(fast_move(2.0, 0.0)));
    sleep(Duration::from_millis(100));

    // Queued while the worker sleeps; only the newest may be applied.
    assert!(guide_loop.send(fast_move(3.0, 0.0)));
    assert!(guide_loop.send(fast_move(5.0, 0.0)));
    assert!(guide_loop.send(fast_move(7.0, 0.0)));
    sleep(Duration::from_millis(900));

    guide_loop.stop();
    let rig = rig.lock().unwrap();
    assert_eq!(
        rig.fast_steps,
        vec![(Axis::X, 1), (Axis::X, 2), (Axis::X, 7)]
    );
}

#[test]
fn stop_preempts_moves_queued_behind_it() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rig = SimRig::new(SimGeometry::default(), SimGeometry::default());
    let calibrations = identity_calibrations();
    let guide_loop = spawn_loop(
        &rig,
        &calibrations,
        GuideLoopConfig {
            min_step_interval: Duration::from_millis(400),
            dead_band_px: 0.1,
        },
    );

    assert!(guide_loop.send(fast_move(1.0, 0.0)));
    sleep(Duration::from_millis(150));
    assert!(guide_loop.send(fast_move(3.0, 0.0)));
    sleep(Duration::from_millis(100));

    // Stop arrives behind two queued moves and must win over both.
    assert!(guide_loop.send(fast_move(5.0, 0.0)));
    assert!(guide_loop.send(fast_move(7.0, 0.0)));
    assert!(guide_loop.send(GuideCorrection::Stop));
    sleep(Duration::from_millis(900));

    // The worker exited without applying the preempted moves.
    assert!(!guide_loop.send(GuideCorrection::Centre));
    {
        let rig = rig.lock().unwrap();
        assert_eq!(rig.fast_steps, vec![(Axis::X, 1), (Axis::X, 3)]);
        assert_eq!(rig.centre_count, 0);
    }
    guide_loop.stop();
}

#[test]
fn dead_band_corrections_apply_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rig = SimRig::new(SimGeometry::default(), SimGeometry::default());
    // Default calibrations: 6 steps per pixel.
    let calibrations = Arc::new(RwLock::new(GuideCalibrations::default()));
    let guide_loop = spawn_loop(
        &rig,
        &calibrations,
        GuideLoopConfig {
            min_step_interval: Duration::ZERO,
            dead_band_px: 0.5,
        },
    );

    // 0.36 px and 0.42 px: both under the band.
    assert!(guide_loop.send(fast_move(0.2, 0.3)));
    assert!(guide_loop.send(fast_move(-0.3, 0.3)));
    sleep(Duration::from_millis(100));

    // 0.57 px clears it.
    assert!(guide_loop.send(fast_move(0.4, 0.4)));
    sleep(Duration::from_millis(100));

    guide_loop.stop();
    let rig = rig.lock().unwrap();
    assert_eq!(rig.fast_steps, vec![(Axis::X, 2), (Axis::Y, 2)]);
}

#[test]
fn travel_limit_hands_accumulated_correction_to_the_mount() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rig = SimRig::new(SimGeometry::default(), SimGeometry::default());
    let calibrations = identity_calibrations();
    let guide_loop = GuideLoop::spawn(
        // The second step command reports a travel limit.
        Box::new(
            SimActuator::new("tilt", Arc::clone(&rig), SimChannel::Fast).with_limit_on_call(1),
        ),
        Box::new(SimActuator::new(
            "mount-port",
            Arc::clone(&rig),
            SimChannel::Mount,
        )),
        Arc::clone(&calibrations),
        GuideLoopConfig {
            min_step_interval: Duration::ZERO,
            dead_band_px: 0.1,
        },
    );

    assert!(guide_loop.send(fast_move(2.0, 0.0)));
    sleep(Duration::from_millis(100));
    assert!(guide_loop.send(fast_move(3.0, 0.0)));
    sleep(Duration::from_millis(200));

    guide_loop.stop();
    let rig = rig.lock().unwrap();
    // The limited attempt moved nothing and triggered a recentre.
    assert_eq!(rig.fast_steps, vec![(Axis::X, 2)]);
    assert_eq!(rig.centre_count, 1);
    // 2 px already applied plus the 3 px the element could not take.
    assert_eq!(rig.mount_steps, vec![(Axis::X, 5)]);
}
