//! Asynchronous plate solving.
//!
//! Solving is off the critical path: acquisition frames are queued to a
//! worker thread and the solution, if any, comes back later through the
//! event stream. A saturated queue drops frames rather than stalling
//! the workflow.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use ndarray::Array2;
use shared::image_proc::frame_median;

use crate::events::RigEvent;

/// External solving engine. `solve` runs on the worker thread and may
/// take seconds; it returns (RA, Dec) in degrees or `None`.
pub trait PlateSolver: Send {
    fn solve(&self, image: &Array2<f64>, hint: Option<(f64, f64)>) -> Option<(f64, f64)>;
}

impl<F> PlateSolver for F
where
    F: Fn(&Array2<f64>, Option<(f64, f64)>) -> Option<(f64, f64)> + Send,
{
    fn solve(&self, image: &Array2<f64>, hint: Option<(f64, f64)>) -> Option<(f64, f64)> {
        self(image, hint)
    }
}

struct SolveJob {
    image: Array2<f64>,
    hint: Option<(f64, f64)>,
}

pub struct SolverHandle {
    jobs: Option<Sender<SolveJob>>,
    thread: Option<JoinHandle<()>>,
}

impl SolverHandle {
    pub fn spawn(solver: Box<dyn PlateSolver>, events: Sender<RigEvent>) -> Self {
        let (tx, rx) = bounded::<SolveJob>(2);
        let thread = std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                let image = flattened(job.image);
                let solution = solver.solve(&image, job.hint).or_else(|| {
                    if job.hint.is_some() {
                        log::debug!("hinted solve failed, retrying blind");
                        solver.solve(&image, None)
                    } else {
                        None
                    }
                });
                match solution {
                    Some((ra_deg, dec_deg)) => {
                        log::info!("plate solution: ra {ra_deg:.4} dec {dec_deg:.4}");
                        let _ = events.send(RigEvent::SolutionReady { ra_deg, dec_deg });
                    }
                    None => log::info!("no plate solution found"),
                }
            }
        });
        Self {
            jobs: Some(tx),
            thread: Some(thread),
        }
    }

    /// Queue a frame for solving. Returns false when the queue is full;
    /// callers skip the frame rather than wait.
    pub fn submit(&self, image: Array2<f64>, hint: Option<(f64, f64)>) -> bool {
        match &self.jobs {
            Some(tx) => tx.try_send(SolveJob { image, hint }).is_ok(),
            None => false,
        }
    }
}

impl Drop for SolverHandle {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Remove the sky pedestal so the engine sees stars on a flat
/// background, clamping at zero.
fn flattened(mut image: Array2<f64>) -> Array2<f64> {
    let background = frame_median(&image.view());
    image.mapv_inplace(|v| (v - background).max(0.0));
    image
}
