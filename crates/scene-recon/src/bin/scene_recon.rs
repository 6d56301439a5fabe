//! scene-recon CLI: reconstruct marker positions from a set of photographs.

use clap::{ArgGroup, Parser, ValueEnum};
use scene_recon::aruco::Dictionary;
use scene_recon::core::{AlignmentConstraint, DistanceConstraint, PinholeCamera, SeedPoint};
use scene_recon::{
    io, Diagnostics, FiducialExtractor, ImageRef, ObservationSource, Pipeline, PseudoMarkerTable,
    ReconConfig, ReconError, ReconstructionResult, Stage,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::Error,
            LogLevel::Warn => Self::Warn,
            LogLevel::Info => Self::Info,
            LogLevel::Debug => Self::Debug,
            LogLevel::Trace => Self::Trace,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "scene-recon")]
#[command(about = "Reconstruct 3D marker positions from overlapping photographs")]
#[command(version)]
#[command(group(ArgGroup::new("source").required(true).args(["dictionary", "pseudo_markers"])))]
struct Cli {
    /// Camera intrinsics and distortion (JSON).
    #[arg(long)]
    camera: PathBuf,

    /// Directory of input images (jpg, jpeg, png).
    #[arg(long)]
    images: Option<PathBuf>,

    /// Marker dictionary (JSON); detect printed fiducials in the images.
    #[arg(long)]
    dictionary: Option<PathBuf>,

    /// Externally located markers (JSON rows of image, marker_id, corners).
    #[arg(long)]
    pseudo_markers: Option<PathBuf>,

    /// Known marker positions fixing the working frame (`marker_id,x,y,z`).
    #[arg(long)]
    known: PathBuf,

    /// Known distances between marker pairs (`marker_id_a,marker_id_b,distance`).
    #[arg(long)]
    distances: PathBuf,

    /// Target positions for the final alignment (`marker_id,x,y,z`).
    #[arg(long)]
    alignment: PathBuf,

    /// Where to write the `marker_id,x,y,z` result table.
    #[arg(long)]
    output: PathBuf,

    /// Where to write the JSON report with diagnostics.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Run configuration (JSON); missing fields use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Emit tracing spans as JSON lines.
    #[cfg(feature = "tracing")]
    #[arg(long)]
    json_logs: bool,
}

/// Written as the report when a stage fails.
#[derive(Serialize)]
struct FailureReport<'a> {
    failed_stage: Stage,
    error: String,
    diagnostics: &'a Diagnostics,
}

fn init_logging(cli: &Cli) -> CliResult<()> {
    #[cfg(feature = "tracing")]
    {
        let _ = tracing_log::LogTracer::init();
        scene_recon::core::init_tracing(cli.json_logs);
        log::set_max_level(cli.log_level.into());
        Ok(())
    }
    #[cfg(not(feature = "tracing"))]
    {
        scene_recon::core::init_with_level(cli.log_level.into())?;
        Ok(())
    }
}

fn load_source(
    cli: &Cli,
    config: &ReconConfig,
) -> CliResult<(Box<dyn ObservationSource>, Vec<ImageRef>)> {
    if let Some(path) = &cli.pseudo_markers {
        let table = PseudoMarkerTable::load_json(path)?;
        let images = match &cli.images {
            Some(dir) => ImageRef::list_dir(dir)?,
            None => table.image_refs("."),
        };
        log::info!("{} pseudo-marker row(s) from {}", table.len(), path.display());
        return Ok((Box::new(table), images));
    }

    let (Some(dict_path), Some(dir)) = (&cli.dictionary, &cli.images) else {
        return Err("--dictionary requires --images".into());
    };
    let dictionary = Dictionary::load_json(dict_path)?;
    log::info!(
        "dictionary {} with {} code(s)",
        dictionary.name,
        dictionary.len()
    );
    let extractor = FiducialExtractor::new(dictionary, config.detector.clone());
    Ok((Box::new(extractor), ImageRef::list_dir(dir)?))
}

fn run(cli: &Cli) -> CliResult<()> {
    let config = match &cli.config {
        Some(path) => ReconConfig::load_json(path)?,
        None => ReconConfig::default(),
    };
    let camera = PinholeCamera::load_json(&cli.camera)?;
    let seeds = io::read_seed_points(&cli.known)?;
    let distances = io::read_distance_constraints(&cli.distances)?;
    let alignment = io::read_alignment_constraints(&cli.alignment)?;
    let (source, images) = load_source(cli, &config)?;
    log::info!("{} image(s) to process", images.len());

    let mut pipeline = Pipeline::new(camera, config);
    let inputs = Inputs {
        images: &images,
        seeds: &seeds,
        distances: &distances,
        alignment: &alignment,
        output: &cli.output,
    };

    match run_stages(&mut pipeline, source.as_ref(), &inputs) {
        Ok(result) => {
            if let Some(path) = &cli.report {
                result.write_json(path)?;
                log::info!("report written to {}", path.display());
            }
            println!(
                "{} marker(s) written to {}",
                result.markers.len(),
                cli.output.display()
            );
            Ok(())
        }
        Err(err) => {
            if let Some(path) = &cli.report {
                let diagnostics = pipeline.diagnostics();
                let report = FailureReport {
                    failed_stage: err.stage(),
                    error: err.to_string(),
                    diagnostics: &diagnostics,
                };
                std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
            }
            Err(err.into())
        }
    }
}

struct Inputs<'a> {
    images: &'a [ImageRef],
    seeds: &'a [SeedPoint],
    distances: &'a [DistanceConstraint],
    alignment: &'a [AlignmentConstraint],
    output: &'a Path,
}

fn run_stages(
    pipeline: &mut Pipeline<PinholeCamera>,
    source: &dyn ObservationSource,
    inputs: &Inputs<'_>,
) -> Result<ReconstructionResult, ReconError> {
    pipeline.observe(source, inputs.images)?;
    pipeline.triangulate(inputs.seeds, &BTreeMap::new())?;
    pipeline.scale(inputs.distances)?;
    pipeline.align(inputs.alignment)?;
    let file = std::fs::File::create(inputs.output).map_err(|source| ReconError::Export {
        stage: Stage::Exported,
        source,
    })?;
    pipeline.export(std::io::BufWriter::new(file))
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(&cli) {
        eprintln!("error: cannot install logger: {err}");
    }
    if let Err(err) = run(&cli) {
        log::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
