//! External registration solver interface.
//!
//! The solver runs out of process. A launch returns immediately with a
//! handle; status arrives over a channel and the caller polls or waits.
//! Cancelling the handle asks the solver to stop and suppresses its result.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use warpdrive_core::error::{Result, WarpDriveError};
use warpdrive_core::spatial::Point3;
use warpdrive_core::GridGeometry;
use warpdrive_io::markups::{write_fcsv, ControlPoint};
use warpdrive_io::nifti_io::write_reference_volume;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Inputs of one solver run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverRequest {
    /// Grid the output field must be sampled on.
    pub reference_grid: GridGeometry,
    /// Target points (where sources should end up).
    pub fixed: Vec<Point3>,
    /// Source points.
    pub moving: Vec<Point3>,
    /// Destination of the displacement field.
    pub output: PathBuf,
    /// Comma-joined influence radius per point.
    pub rbf_radius: String,
    pub stiffness: f64,
    /// Scratch directory for solver inputs.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SolverStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SolverStatus::Running)
    }
}

/// A status notification from a solver run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverEvent {
    pub status: SolverStatus,
    pub message: Option<String>,
}

impl SolverEvent {
    pub fn running() -> Self {
        Self {
            status: SolverStatus::Running,
            message: None,
        }
    }
}

/// Sending side of a solver run, owned by the solver implementation.
#[derive(Debug, Clone)]
pub struct SolverReporter {
    sender: Sender<SolverEvent>,
    cancel: Arc<AtomicBool>,
}

impl SolverReporter {
    /// Report a status. Dropped silently once the handle is gone.
    pub fn report(&self, status: SolverStatus, message: Option<String>) {
        let _ = self.sender.send(SolverEvent { status, message });
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Receiving side of a solver run.
#[derive(Debug)]
pub struct SolverHandle {
    receiver: Receiver<SolverEvent>,
    cancel: Arc<AtomicBool>,
    output: PathBuf,
    finished: Option<SolverEvent>,
}

impl SolverHandle {
    /// Create a connected reporter and handle for a run writing `output`.
    pub fn channel(output: impl Into<PathBuf>) -> (SolverReporter, SolverHandle) {
        let (sender, receiver) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        (
            SolverReporter {
                sender,
                cancel: Arc::clone(&cancel),
            },
            SolverHandle {
                receiver,
                cancel,
                output: output.into(),
                finished: None,
            },
        )
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Latest status without blocking.
    pub fn try_status(&mut self) -> SolverEvent {
        if let Some(event) = &self.finished {
            return event.clone();
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.status.is_terminal() => return self.finish(event),
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return SolverEvent::running(),
                Err(TryRecvError::Disconnected) => return self.finish(disconnected()),
            }
        }
    }

    /// Block until the run reaches a terminal status.
    pub fn wait(&mut self) -> SolverEvent {
        if let Some(event) = &self.finished {
            return event.clone();
        }
        loop {
            match self.receiver.recv() {
                Ok(event) if event.status.is_terminal() => return self.finish(event),
                Ok(_) => continue,
                Err(_) => return self.finish(disconnected()),
            }
        }
    }

    /// Ask the solver to stop. Its result will not be used.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn finish(&mut self, event: SolverEvent) -> SolverEvent {
        self.finished = Some(event.clone());
        event
    }
}

fn disconnected() -> SolverEvent {
    SolverEvent {
        status: SolverStatus::Failed,
        message: Some("solver stopped without reporting a result".to_string()),
    }
}

/// Something that computes a displacement field from point correspondences.
pub trait RegistrationSolver {
    /// Start a run. Must not block until the run completes.
    fn launch(&self, request: SolverRequest) -> Result<SolverHandle>;
}

impl<S: RegistrationSolver + ?Sized> RegistrationSolver for &S {
    fn launch(&self, request: SolverRequest) -> Result<SolverHandle> {
        (**self).launch(request)
    }
}

impl RegistrationSolver for Box<dyn RegistrationSolver> {
    fn launch(&self, request: SolverRequest) -> Result<SolverHandle> {
        (**self).launch(request)
    }
}

/// Runs a command-line solver executable in a background thread.
///
/// Invoked as
/// `<exe> --referenceVolume <ref> --fixedFiducials <fixed.fcsv>
/// --movingFiducials <moving.fcsv> --outputDisplacementField <out>
/// --RBFRadius <r1,r2,..> --stiffness <s>`.
#[derive(Debug, Clone)]
pub struct ProcessSolver {
    executable: PathBuf,
}

impl ProcessSolver {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn command(&self, request: &SolverRequest, inputs: &SolverInputs) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("--referenceVolume")
            .arg(&inputs.reference)
            .arg("--fixedFiducials")
            .arg(&inputs.fixed)
            .arg("--movingFiducials")
            .arg(&inputs.moving)
            .arg("--outputDisplacementField")
            .arg(&request.output)
            .arg("--RBFRadius")
            .arg(&request.rbf_radius)
            .arg("--stiffness")
            .arg(request.stiffness.to_string());
        command
    }
}

struct SolverInputs {
    reference: PathBuf,
    fixed: PathBuf,
    moving: PathBuf,
}

fn write_inputs(request: &SolverRequest) -> Result<SolverInputs> {
    std::fs::create_dir_all(&request.work_dir)?;
    let inputs = SolverInputs {
        reference: request.work_dir.join("reference.nii.gz"),
        fixed: request.work_dir.join("fixed.fcsv"),
        moving: request.work_dir.join("moving.fcsv"),
    };

    write_reference_volume(&inputs.reference, &request.reference_grid).map_err(|e| {
        WarpDriveError::inconsistent_state(format!("failed to write solver reference: {e:#}"))
    })?;
    let to_points = |points: &[Point3]| -> Vec<ControlPoint> {
        points.iter().map(|p| ControlPoint::new(*p)).collect()
    };
    write_fcsv(&inputs.fixed, &to_points(&request.fixed))?;
    write_fcsv(&inputs.moving, &to_points(&request.moving))?;
    Ok(inputs)
}

impl RegistrationSolver for ProcessSolver {
    fn launch(&self, request: SolverRequest) -> Result<SolverHandle> {
        if request.fixed.len() != request.moving.len() {
            return Err(WarpDriveError::invalid_parameter(format!(
                "{} fixed points vs {} moving points",
                request.fixed.len(),
                request.moving.len()
            )));
        }
        let inputs = write_inputs(&request)?;
        let child = self.command(&request, &inputs).spawn().map_err(|e| {
            WarpDriveError::external_tool(format!(
                "failed to start {}: {}",
                self.executable.display(),
                e
            ))
        })?;

        tracing::info!(
            solver = %self.executable.display(),
            points = request.fixed.len(),
            radius = %request.rbf_radius,
            stiffness = request.stiffness,
            "launched registration solver"
        );

        let (reporter, handle) = SolverHandle::channel(&request.output);
        reporter.report(SolverStatus::Running, None);
        let output = request.output.clone();
        thread::spawn(move || supervise(child, &output, &reporter));
        Ok(handle)
    }
}

fn supervise(mut child: Child, output: &Path, reporter: &SolverReporter) {
    loop {
        if reporter.cancel_requested() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::info!("registration solver cancelled");
            reporter.report(SolverStatus::Cancelled, None);
            return;
        }
        match child.try_wait() {
            Ok(Some(status)) if status.success() && output.is_file() => {
                tracing::info!("registration solver completed");
                reporter.report(SolverStatus::Completed, None);
                return;
            }
            Ok(Some(status)) => {
                let message = if status.success() {
                    format!("solver produced no output at {}", output.display())
                } else {
                    format!("solver exited with {status}")
                };
                tracing::error!("{}", message);
                reporter.report(SolverStatus::Failed, Some(message));
                return;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                tracing::error!("failed to query solver process: {}", e);
                reporter.report(SolverStatus::Failed, Some(e.to_string()));
                return;
            }
        }
    }
}
