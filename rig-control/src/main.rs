//! Operator console for the imaging rig.
//!
//! One binary drives the whole stack through subcommands:
//! - `run`: execute a bias/dark/flat/science/acquisition/continuous sequence
//! - `guide`: hold the guide star with the closed correction loop
//! - `train`: measure actuator axis calibrations with the bracket test
//! - `config`: write a default configuration file for hand editing
//!
//! Everything runs against simulated devices by default; `--ao-port`
//! switches the correction channels to a real AO unit on a serial line.
//! Camera frames stay synthetic either way, so the whole control stack
//! can be exercised on a desk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hardware::serial_tilt::SerialTilt;
use hardware::sim::{
    SimActuator, SimCamera, SimChannel, SimGeometry, SimGuideCamera, SimMount, SimRig,
};
use sequencer::guiding::AxisCalibration;
use sequencer::{RigConfig, RigController, RigDrivers, RigEvent, SequenceParams, WorkflowOutcome};
use shared::drivers::{ActuatorDriver, NoDisplay};
use shared::SequenceKind;

/// Wait per coordinator pump turn; bounds interrupt latency.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Star-field seed of the simulated main camera.
const SIM_FIELD_SEED: u64 = 17;

/// Pointing reported by the simulated mount, in degrees.
const SIM_RA_DEG: f64 = 83.82;
const SIM_DEC_DEG: f64 = -5.39;

/// Imaging rig acquisition and guiding console
#[derive(Parser, Debug)]
#[command(name = "rig-control")]
#[command(about = "Acquisition and guiding console for the imaging rig")]
#[command(version)]
struct Args {
    /// Configuration file; built-in defaults apply when it does not exist
    #[arg(long, global = true, default_value = "rig.json")]
    config: PathBuf,

    /// Override the night data root from the configuration
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    /// Serial port of the AO unit; simulated actuators when omitted
    #[arg(long, global = true)]
    ao_port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one acquisition sequence to completion
    Run {
        /// Sequence kind
        kind: KindArg,

        /// Frames to take (configured default when omitted)
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Exposure time in seconds (configured default when omitted)
        #[arg(short = 'e', long)]
        exptime: Option<f64>,

        /// Pause between frames in seconds
        #[arg(short = 'd', long, default_value = "0.0")]
        delay: f64,

        /// Hold the guide star with the correction loop while exposing
        #[arg(short = 'g', long)]
        guide: bool,
    },

    /// Close the guide loop without running a sequence
    Guide {
        /// Stop after this many seconds (runs until Ctrl+C if not specified)
        #[arg(short = 't', long)]
        max_runtime_secs: Option<u64>,
    },

    /// Train actuator axis calibrations with the bracket test
    Train,

    /// Write a default configuration file for hand editing
    Config {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Bias,
    Dark,
    Flat,
    Science,
    Acquisition,
    Continuous,
}

impl From<KindArg> for SequenceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Bias => SequenceKind::Bias,
            KindArg::Dark => SequenceKind::Dark,
            KindArg::Flat => SequenceKind::Flat,
            KindArg::Science => SequenceKind::Science,
            KindArg::Acquisition => SequenceKind::Acquisition,
            KindArg::Continuous => SequenceKind::Continuous,
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    notify_on_panic();

    let args = Args::parse();

    match &args.command {
        Command::Run {
            kind,
            count,
            exptime,
            delay,
            guide,
        } => with_rig(&args, |rig, interrupted| {
            cmd_run(
                rig,
                interrupted,
                (*kind).into(),
                *count,
                *exptime,
                *delay,
                *guide,
            )
        }),
        Command::Guide { max_runtime_secs } => {
            let deadline = *max_runtime_secs;
            with_rig(&args, |rig, interrupted| cmd_guide(rig, interrupted, deadline))
        }
        Command::Train => with_rig(&args, |rig, _| cmd_train(rig)),
        Command::Config { force } => cmd_config(&args.config, *force),
    }
}

/// Build the controller, run one command against it, and shut the rig
/// down regardless of how the command ended.
fn with_rig<F>(args: &Args, f: F) -> Result<()>
where
    F: FnOnce(&mut RigController, &AtomicBool) -> Result<()>,
{
    let config = load_config(&args.config, args.store_root.as_deref())?;
    let drivers = build_drivers(args.ao_port.as_deref());
    let mut rig = RigController::new(config, drivers);

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing the interrupt handler")?;

    let result = f(&mut rig, interrupted.as_ref());
    rig.shutdown();
    result
}

fn load_config(path: &Path, store_root: Option<&Path>) -> Result<RigConfig> {
    let mut config = if path.exists() {
        let config =
            RigConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
        info!("configuration loaded from {}", path.display());
        config
    } else {
        info!(
            "no configuration at {}, using built-in defaults",
            path.display()
        );
        RigConfig::default()
    };
    if let Some(root) = store_root {
        config.store_root = root.to_path_buf();
    }
    info!("night data root: {}", config.store_root.display());
    Ok(config)
}

/// Assemble the device set. The cameras and the mount are always the
/// simulated ones; the correction channels come from a real AO unit when
/// a serial port is given.
fn build_drivers(ao_port: Option<&str>) -> RigDrivers {
    // The simulated AO element mounts with its axes rotated against the
    // guide camera, which is exactly what training has to discover.
    let optics = SimRig::new(
        SimGeometry {
            axes_swapped: true,
            invert_x: false,
            invert_y: true,
            px_per_step: 0.165,
        },
        SimGeometry {
            px_per_step: 0.05,
            ..SimGeometry::default()
        },
    );

    let (fast_actuator, mount_actuator): (Box<dyn ActuatorDriver>, Box<dyn ActuatorDriver>) =
        match ao_port {
            Some(path) => {
                warn!("driving the AO unit at {path}; camera frames stay synthetic");
                let tilt = SerialTilt::open(path);
                let relay = tilt.mount_relay();
                (Box::new(tilt), Box::new(relay))
            }
            None => (
                Box::new(SimActuator::new(
                    "ao-tilt",
                    Arc::clone(&optics),
                    SimChannel::Fast,
                )),
                Box::new(SimActuator::new(
                    "ao-mount-relay",
                    Arc::clone(&optics),
                    SimChannel::Mount,
                )),
            ),
        };

    RigDrivers {
        main_camera: Box::new(SimCamera::new("main-camera", (512, 512), SIM_FIELD_SEED)),
        guide_camera: Box::new(SimGuideCamera::new("guide-camera", (128, 128), optics)),
        fast_actuator,
        mount_actuator,
        mount: Some(Box::new(SimMount::new(SIM_RA_DEG, SIM_DEC_DEG))),
        display: Box::new(NoDisplay),
        // The synthetic sky has no catalogue to match against; echoing
        // the pointing hint exercises the acquisition path end to end.
        solver: Some(Box::new(
            |_: &Array2<f64>, hint: Option<(f64, f64)>| hint,
        )),
    }
}

fn cmd_run(
    rig: &mut RigController,
    interrupted: &AtomicBool,
    kind: SequenceKind,
    count: Option<usize>,
    exptime: Option<f64>,
    delay_s: f64,
    guide: bool,
) -> Result<()> {
    let count = count.unwrap_or(match kind {
        // Zero lets a continuous run go to its configured frame cap.
        SequenceKind::Continuous => 0,
        _ => rig.config().exposure.default_count,
    });
    let exptime_s = exptime.unwrap_or(rig.config().exposure.default_exptime_s);

    if guide {
        rig.start_guiding().context("starting the guide loop")?;
    }

    info!(
        "{} sequence: {count} frame(s) at {exptime_s:.2}s",
        kind.label()
    );
    let params = SequenceParams::new(count, exptime_s).with_delay(delay_s);
    rig.start_sequence(kind, params)
        .context("starting the sequence")?;

    let events = rig.events();
    let outcome = loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            warn!("interrupted, aborting the sequence");
            rig.abort_sequence();
        }
        rig.pump(PUMP_INTERVAL);

        let mut done = None;
        while let Ok(event) = events.try_recv() {
            if let Some(outcome) = report(event) {
                done = Some(outcome);
            }
        }
        if let Some(outcome) = done {
            break outcome;
        }
    };

    if guide {
        rig.stop_guiding();
    }

    match outcome {
        WorkflowOutcome::Completed => Ok(()),
        WorkflowOutcome::Aborted => Ok(()),
        WorkflowOutcome::Failed(reason) => bail!("sequence failed: {reason}"),
        WorkflowOutcome::FlatNotAchievable => {
            bail!("no exposure reaches the flat counts window; wait for the sky to change or widen the window")
        }
    }
}

fn cmd_guide(
    rig: &mut RigController,
    interrupted: &AtomicBool,
    max_runtime_secs: Option<u64>,
) -> Result<()> {
    rig.start_guiding().context("starting the guide loop")?;
    match max_runtime_secs {
        Some(secs) => info!("guiding for {secs}s"),
        None => info!("guiding until Ctrl+C"),
    }

    let deadline = max_runtime_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let events = rig.events();
    loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            info!("interrupted, stopping the guide loop");
            break;
        }
        if let Some(at) = deadline {
            if Instant::now() >= at {
                info!("guide runtime reached");
                break;
            }
        }
        rig.pump(PUMP_INTERVAL);
        while let Ok(event) = events.try_recv() {
            let _ = report(event);
        }
    }

    rig.stop_guiding();
    Ok(())
}

fn cmd_train(rig: &mut RigController) -> Result<()> {
    info!("training actuator calibrations; keep the rig still");
    let trained = rig.train_guiding().context("actuator training")?;
    info!("fast:  {}", describe_axes(&trained.fast));
    info!("mount: {}", describe_axes(&trained.mount));
    Ok(())
}

fn describe_axes(axes: &AxisCalibration) -> String {
    let orientation = |inverted: bool| if inverted { "inverted" } else { "direct" };
    format!(
        "{:.2} steps/px, axes {}, x {}, y {}",
        axes.steps_per_pixel,
        if axes.axes_swapped {
            "swapped"
        } else {
            "aligned"
        },
        orientation(axes.invert_x),
        orientation(axes.invert_y),
    )
}

fn cmd_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (pass --force to overwrite it)",
            path.display()
        );
    }
    RigConfig::default()
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("wrote default configuration to {}", path.display());
    Ok(())
}

/// Mirror one event stream entry to the console. Returns the outcome
/// when the active workflow finished.
fn report(event: RigEvent) -> Option<WorkflowOutcome> {
    match event {
        RigEvent::FrameReady {
            kind,
            index,
            simulated,
            path,
        } => {
            let origin = if simulated { " (synthetic fallback)" } else { "" };
            match path {
                Some(path) => info!(
                    "frame {index} [{}]{origin} -> {}",
                    kind.label(),
                    path.display()
                ),
                None => info!("frame {index} [{}]{origin}", kind.label()),
            }
            None
        }
        // The controller mirrors these through the logger already;
        // printing them again would double every line.
        RigEvent::LogLine(_) => None,
        RigEvent::WorkflowDone { kind, outcome } => {
            info!("{} sequence finished: {outcome:?}", kind.label());
            Some(outcome)
        }
        RigEvent::SolutionReady { ra_deg, dec_deg } => {
            info!("plate solution: ra {ra_deg:.4} dec {dec_deg:.4}");
            None
        }
    }
}

/// Whatever else a fault takes down, the operator gets one clear
/// instruction on the console.
fn notify_on_panic() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        eprintln!("rig-control hit an unrecoverable fault; please restart it");
    }));
}
