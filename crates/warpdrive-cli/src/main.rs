use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use burn_ndarray::NdArray;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use warpdrive_core::convert::inverse_consistency_error;
use warpdrive_correction::{
    finish_subject, load_subject_transform, CommitOutcome, CorrectionEngine, Correspondence, CorrespondenceSet,
    EngineState, FinishChoice, FinishOutcome, LaunchArgs, ProcessSolver, SessionContext, SessionMode,
    WarpDriveConfig,
};
use warpdrive_io::markups::read_fcsv;
use warpdrive_io::migrate::needs_migration;
use warpdrive_io::nifti_io::read_displacement_field;
use warpdrive_io::{load_approval_state, set_approved, update_legacy_transform_format, SubjectPaths};

type Backend = NdArray<f32>;

#[derive(Parser)]
#[command(name = "warpdrive")]
#[command(about = "Interactive correction of subject-to-template warps")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process subjects handed over by the host tool: `<hostRoot> <subject>[,<subject>...]`
    Launch {
        #[arg(required = true, num_args = 2..)]
        args: Vec<String>,

        /// External registration solver executable
        #[arg(long)]
        solver: Option<PathBuf>,

        /// What to do with each subject once its saved corrections are committed
        #[arg(long, value_enum, default_value_t = FinishArg::Save)]
        finish: FinishArg,
    },

    /// Show layout, approval and correction state of a subject
    Status { subject: PathBuf },

    /// Mark a subject's normalization as approved
    Approve { subject: PathBuf },

    /// Flatten composite warps into displacement fields
    Migrate {
        subject: PathBuf,

        /// Transform resampling executable
        #[arg(short, long)]
        tool: PathBuf,
    },

    /// Correct a subject from source and target point files
    Correct {
        subject: PathBuf,

        /// Points to move (.fcsv); a numeric description is the point's radius
        #[arg(long)]
        sources: PathBuf,

        /// Where the source points should end up (.fcsv)
        #[arg(long)]
        targets: PathBuf,

        /// External registration solver executable
        #[arg(long)]
        solver: Option<PathBuf>,

        /// Transform resampling executable, for subjects with composite warps
        #[arg(long)]
        tool: Option<PathBuf>,

        /// Harden the correction into the subject's warps and approve
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FinishArg {
    Save,
    Discard,
}

impl From<FinishArg> for FinishChoice {
    fn from(arg: FinishArg) -> Self {
        match arg {
            FinishArg::Save => FinishChoice::Save,
            FinishArg::Discard => FinishChoice::Discard,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &cli.config {
        Some(path) => WarpDriveConfig::from_file(path)?,
        None => WarpDriveConfig::default(),
    };

    match cli.command {
        Commands::Launch { args, solver, finish } => {
            launch(&args, config, solver, finish.into())?;
        }
        Commands::Status { subject } => {
            status(&subject, &config)?;
        }
        Commands::Approve { subject } => {
            let paths = SubjectPaths::resolve(&subject)?;
            set_approved(&paths)?;
            info!("Approved {}", paths.subject_id());
        }
        Commands::Migrate { subject, tool } => {
            let paths = SubjectPaths::resolve(&subject)?;
            if update_legacy_transform_format(&paths, &tool, config.anchor_modality.as_deref())? {
                info!("Migrated composite warps of {}", paths.subject_id());
            } else {
                info!("Nothing to migrate for {}", paths.subject_id());
            }
        }
        Commands::Correct {
            subject,
            sources,
            targets,
            solver,
            tool,
            save,
        } => {
            let points = read_correspondences(&sources, &targets, config.default_rbf_radius)?;
            let solver = solver_for(solver, &config)?;
            let mut ctx = SessionContext::<Backend>::open(
                &subject,
                SessionMode::Interactive,
                config,
                tool.as_deref(),
                &Default::default(),
            )?;
            points.record_in_session(ctx.session_mut(), "Correction 1");
            commit(&mut ctx, &solver, &points)?;
            let choice = if save { FinishChoice::Save } else { FinishChoice::Discard };
            finish_subject(&mut ctx, choice)?;
        }
    }

    Ok(())
}

fn launch(args: &[String], config: WarpDriveConfig, solver: Option<PathBuf>, choice: FinishChoice) -> Result<()> {
    let Some(launch) = LaunchArgs::parse(args) else {
        anyhow::bail!("Expected `<hostRoot> <subject>[,<subject>...]` with a lead.m in hostRoot");
    };
    let tool = launch.apply_transforms_tool();
    let solver = solver_for(solver, &config)?;

    let mut queue = launch.queue();
    let mut current = Some(launch.current().to_path_buf());
    while let Some(subject) = current {
        info!("Processing {}", subject.display());
        let mode = SessionMode::SingleSubject { queue: queue.clone() };
        match process_subject(&subject, mode, &config, &tool, &solver, choice) {
            Ok(remaining) => queue = remaining,
            Err(e) => warn!("Skipping {}: {:#}", subject.display(), e),
        }
        current = queue.pop_front();
    }
    info!("All subjects processed");
    Ok(())
}

/// Commit a subject's saved corrections and finish it. Returns the
/// subjects still queued.
fn process_subject(
    subject: &Path,
    mode: SessionMode,
    config: &WarpDriveConfig,
    tool: &Path,
    solver: &ProcessSolver,
    choice: FinishChoice,
) -> Result<VecDeque<PathBuf>> {
    let mut ctx = SessionContext::<Backend>::open(subject, mode, config.clone(), Some(tool), &Default::default())?;

    let points = CorrespondenceSet::from_session(ctx.session(), config.default_rbf_radius);
    if points.pairs().is_empty() {
        info!("No saved corrections for {}", ctx.paths().subject_id());
    } else {
        commit(&mut ctx, solver, &points)?;
    }

    let next = match finish_subject(&mut ctx, choice)? {
        FinishOutcome::Finished { next } => next,
        FinishOutcome::Stayed => None,
    };
    let mut remaining = ctx.close();
    if let Some(next) = next {
        remaining.push_front(next);
    }
    Ok(remaining)
}

fn solver_for(explicit: Option<PathBuf>, config: &WarpDriveConfig) -> Result<ProcessSolver> {
    explicit
        .or_else(|| config.solver_executable.clone())
        .map(ProcessSolver::new)
        .context("No solver executable given (use --solver or `solver_executable` in the config)")
}

fn read_correspondences(sources: &Path, targets: &Path, default_radius: f64) -> Result<CorrespondenceSet> {
    let sources = read_fcsv(sources)?;
    let targets = read_fcsv(targets)?;
    if sources.len() != targets.len() {
        anyhow::bail!(
            "Point files differ in length: {} sources, {} targets",
            sources.len(),
            targets.len()
        );
    }

    let mut set = CorrespondenceSet::new(default_radius);
    for (source, target) in sources.iter().zip(&targets) {
        let mut pair = Correspondence::new(source.position, target.position)
            .with_selected(source.selected && target.selected);
        if let Ok(radius) = source.description.trim().parse::<f64>() {
            pair = pair.with_radius(radius);
        }
        set.push(pair);
    }
    Ok(set)
}

fn commit(ctx: &mut SessionContext<Backend>, solver: &ProcessSolver, points: &CorrespondenceSet) -> Result<()> {
    let mut engine = CorrectionEngine::<Backend, _>::new(solver, Default::default());
    let preview = engine.preview(points)?;
    info!("Previewing {} correspondences", preview.glyphs().len());

    if engine.commit(ctx, points)? == CommitOutcome::Applied {
        info!("No selected correspondences, correction is identity");
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    spinner.set_message(format!("Solving correction for {}", ctx.paths().subject_id()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = loop {
        match engine.poll(ctx) {
            Ok(EngineState::Committing) => std::thread::sleep(Duration::from_millis(100)),
            other => break other,
        }
    };
    spinner.finish_and_clear();
    result?;

    info!("Correction attached for {}", ctx.paths().subject_id());
    Ok(())
}

fn status(subject: &Path, config: &WarpDriveConfig) -> Result<()> {
    let paths = SubjectPaths::resolve(subject)?;
    info!("Subject: {} ({:?} layout)", paths.subject_id(), paths.kind());
    info!("Approved: {}", load_approval_state(&paths)?);
    info!("Needs migration: {}", needs_migration(&paths));
    info!(
        "Saved session: {}",
        paths.warpdrive_dir().join(warpdrive_io::session::MANIFEST_FILE).is_file()
    );

    let device = Default::default();
    if needs_migration(&paths) {
        warn!("Composite warps present, run `warpdrive migrate` first");
        return Ok(());
    }
    let forward = paths.forward_warp();
    let inverse = paths.inverse_warp();
    if !forward.is_file() {
        warn!("Forward warp missing: {}", forward.display());
        return Ok(());
    }
    let field = load_subject_transform::<Backend>(&paths, None, config.anchor_modality.as_deref(), &device)?;
    info!(
        "Forward warp: {:?} voxels, max displacement {:.2} mm",
        field.grid().size(),
        field.max_displacement()
    );

    if inverse.is_file() {
        let inverse = read_displacement_field::<Backend, _>(&inverse, &device)?;
        let error = inverse_consistency_error(&field, &inverse)?;
        info!("Inverse consistency error: {:.3} mm", error);
    } else {
        warn!("Inverse warp missing: {}", inverse.display());
    }
    Ok(())
}
