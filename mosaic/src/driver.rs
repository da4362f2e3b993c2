//! Mosaic assembly
//!
//! [`build_mosaic`] runs the in-memory pipeline (resolution matching,
//! reprojection, combination) on pointings the caller already holds.
//! [`run`] is the file-level pipeline behind `make_mosaic`: it checks every
//! required artifact up front, reads and writes the pointing files following
//! the naming convention, and only writes FITS output once the whole run has
//! succeeded.

use crate::combine::{combine_pointings, MosaicOutput};
use crate::config::{MosaicConfig, RunConfig};
use crate::convolution::ConvolutionEngine;
use crate::error::MosaicError;
use crate::io::{read_pointing, write_mosaic, write_pointing};
use crate::naming::{missing_artifacts, ArtifactNames};
use crate::pointing::{check_plane_counts, MosaicType, Pointing, SkyGrid, SpectralAxis};
use crate::psf::{enclosing_psf, PsfDescriptor};
use crate::report::{Reporter, RunEvent, Stage};
use crate::reproject::{check_footprint, Reprojector};
use crate::resolution::{select_targets, PsfPolicy};
use crate::weights::Cutoff;
use serde::Serialize;
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

/// Relative agreement below which two pointing PSFs count as the same beam
const SAME_BEAM_TOLERANCE: f64 = 1e-6;

/// Result of [`build_mosaic`]
#[derive(Debug, Clone)]
pub struct MosaicProduct {
    pub output: MosaicOutput,
    pub grid: SkyGrid,
    pub spectral: Option<SpectralAxis>,
    /// Per-channel PSF of the mosaic, when resolution matching ran
    pub targets: Option<Vec<PsfDescriptor>>,
}

/// Pointings after the optional resolution matching step
#[derive(Debug, Clone)]
pub struct MatchedPointings<'a> {
    pub pointings: Cow<'a, [Pointing]>,
    /// Per-channel target PSFs, `None` when the pointings kept their native resolution
    pub targets: Option<Vec<PsfDescriptor>>,
}

/// Bring every pointing to the target resolution chosen by `config`.
///
/// Without a resolution config the pointings are borrowed unchanged.
pub fn match_resolution<'a>(
    pointings: &'a [Pointing],
    config: &MosaicConfig,
    reporter: &dyn Reporter,
) -> Result<MatchedPointings<'a>, MosaicError> {
    let Some(resolution) = &config.resolution else {
        reporter.info("Resolution matching disabled, pointings keep their native PSFs".to_string());
        return Ok(MatchedPointings {
            pointings: Cow::Borrowed(pointings),
            targets: None,
        });
    };

    let plan = select_targets(pointings, resolution, reporter)?;
    let engine = ConvolutionEngine::new(
        config.workers,
        resolution.circularize,
        config.kernel_tolerance,
    )?;
    let convolved = engine.convolve_pointings(pointings, &plan, reporter)?;

    Ok(MatchedPointings {
        pointings: Cow::Owned(convolved),
        targets: plan.pointing_targets(0).map(|targets| targets.to_vec()),
    })
}

/// Per-channel PSF of a set of matched pointings.
///
/// Channels where the pointings disagree (a circularised kernel broadens
/// each pointing differently) get the beam enclosing all of them and a
/// warning. `None` when any pointing lacks a PSF table.
pub fn mosaic_psfs(
    pointings: &[Pointing],
    reporter: &dyn Reporter,
) -> Option<Vec<PsfDescriptor>> {
    let tables = pointings
        .iter()
        .map(|p| p.psfs())
        .collect::<Option<Vec<_>>>()?;
    let channels = tables.first()?.len();

    (0..channels)
        .map(|channel| {
            let beams = tables
                .iter()
                .map(|table| table.get(channel).copied())
                .collect::<Option<Vec<_>>>()?;
            let first = beams[0];
            if beams.iter().all(|b| same_beam(b, &first)) {
                return Some(first);
            }
            let enclosing = enclosing_psf(&beams)?;
            reporter.warn(format!(
                "Channel {channel}: pointing PSFs differ after convolution, \
                 mosaic header uses the enclosing beam {enclosing}"
            ));
            Some(enclosing)
        })
        .collect()
}

fn same_beam(a: &PsfDescriptor, b: &PsfDescriptor) -> bool {
    let close = |x: f64, y: f64| {
        (x - y).abs() <= SAME_BEAM_TOLERANCE * x.abs().max(y.abs()).max(1.0)
    };
    // Position angle is meaningless for a circular beam
    let circular = close(a.bmaj(), a.bmin()) && close(b.bmaj(), b.bmin());
    close(a.bmaj(), b.bmaj()) && close(a.bmin(), b.bmin()) && (circular || close(a.bpa(), b.bpa()))
}

/// Resample every pointing onto the grid chosen by `reprojector`
pub fn regrid_pointings(
    pointings: &[Pointing],
    reprojector: &dyn Reprojector,
    reporter: &dyn Reporter,
) -> Result<(SkyGrid, Vec<Pointing>), MosaicError> {
    reporter.stage(Stage::Reprojection);
    let grid = reprojector.common_grid(pointings)?;
    reporter.info(format!(
        "Mosaic grid is {}x{} pixels",
        grid.cols, grid.rows
    ));

    let mut regridded = Vec::with_capacity(pointings.len());
    for pointing in pointings {
        let resampled = reprojector.reproject(pointing, &grid)?;
        check_footprint(&resampled)?;
        reporter.report(RunEvent::Reprojected {
            pointing: pointing.id().to_string(),
        });
        regridded.push(resampled);
    }
    Ok((grid, regridded))
}

/// Build a mosaic from pointings held in memory.
///
/// Validates the pointing count and plane layout before any numeric work.
pub fn build_mosaic(
    pointings: &[Pointing],
    config: &MosaicConfig,
    reprojector: &dyn Reprojector,
    reporter: &dyn Reporter,
) -> Result<MosaicProduct, MosaicError> {
    reporter.stage(Stage::Preflight);
    if pointings.len() < 2 {
        return Err(MosaicError::InsufficientPointings(pointings.len()));
    }
    check_plane_counts(pointings, config.mosaic_type)?;

    let matched = match_resolution(pointings, config, reporter)?;
    let (grid, regridded) = regrid_pointings(&matched.pointings, reprojector, reporter)?;
    let output = combine_pointings(&regridded, config.cutoff, reporter)?;
    let targets = matched
        .targets
        .and_then(|_| mosaic_psfs(&regridded, reporter));

    Ok(MosaicProduct {
        output,
        grid,
        spectral: pointings[0].spectral().cloned(),
        targets,
    })
}

/// What a finished run did, written next to its outputs as JSON
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub name: String,
    pub mosaic_type: MosaicType,
    /// `None` when resolution matching was not requested
    pub policy: Option<PsfPolicy>,
    pub circularize: bool,
    pub cutoff: Cutoff,
    /// Whether reprojection ran as part of this run
    pub regridded: bool,
    /// False for a convolve-only pass that leaves regridding and combination to a later run
    pub combined: bool,
    pub pointings: Vec<String>,
    /// Target PSFs chosen by the resolution policy
    pub channel_targets: Option<Vec<PsfDescriptor>>,
    /// PSFs written to the mosaic header
    pub mosaic_psfs: Option<Vec<PsfDescriptor>>,
    pub channels: usize,
    /// Fraction of mosaic pixels with coverage, `None` when nothing was combined
    pub coverage: Option<f64>,
    pub outputs: Vec<PathBuf>,
}

fn read_sources(config: &RunConfig) -> Result<Vec<Pointing>, MosaicError> {
    config
        .targets
        .iter()
        .map(|names| {
            let [(_, image), (_, beam)] = names.sources(&config.input_dir);
            read_pointing(&names.id, &image, &beam)
        })
        .collect()
}

fn read_regridded(config: &RunConfig) -> Result<Vec<Pointing>, MosaicError> {
    config
        .targets
        .iter()
        .map(|names| {
            let [(_, image), (_, beam)] = names.regridded(&config.output_dir);
            read_pointing(&names.id, &image, &beam)
        })
        .collect()
}

fn write_pointings<F>(
    targets: &[ArtifactNames],
    pointings: &[Pointing],
    output_dir: &Path,
    paths: F,
    reporter: &dyn Reporter,
) -> Result<Vec<PathBuf>, MosaicError>
where
    F: Fn(&ArtifactNames) -> (String, String),
{
    let mut written = Vec::with_capacity(2 * pointings.len());
    for (names, pointing) in targets.iter().zip(pointings) {
        let (image, beam) = paths(names);
        let image = output_dir.join(image);
        let beam = output_dir.join(beam);
        write_pointing(pointing, &image, &beam)?;
        reporter.report(RunEvent::ArtifactWritten(image.clone()));
        reporter.report(RunEvent::ArtifactWritten(beam.clone()));
        written.push(image);
        written.push(beam);
    }
    Ok(written)
}

fn write_summary(
    summary: &RunSummary,
    path: &Path,
    reporter: &dyn Reporter,
) -> Result<(), MosaicError> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json).map_err(|source| MosaicError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    reporter.report(RunEvent::ArtifactWritten(path.to_path_buf()));
    Ok(())
}

/// Regridded pointings on disk must share one grid
fn shared_grid(pointings: &[Pointing]) -> Result<SkyGrid, MosaicError> {
    let first = pointings
        .first()
        .ok_or(MosaicError::InsufficientPointings(0))?;
    for pointing in &pointings[1..] {
        if !pointing.grid().matches(first.grid()) {
            return Err(MosaicError::ShapeMismatch {
                pointing: pointing.id().to_string(),
                detail: format!("regridded WCS differs from '{}'", first.id()),
            });
        }
    }
    Ok(first.grid().clone())
}

/// PSFs shared by every pointing, if they all carry the same table
fn common_psfs(pointings: &[Pointing]) -> Option<Vec<PsfDescriptor>> {
    let first = pointings.first()?.psfs()?;
    pointings
        .iter()
        .all(|p| p.psfs() == Some(first))
        .then(|| first.to_vec())
}

/// Run the file-level mosaic pipeline described by `config`.
///
/// Every source image and beam must exist before anything is read. A run
/// that combines on-disk regridded pointings also checks for every
/// `imageR`/`pbR` file up front; both checks list all missing files at once.
///
/// Resolution matching without regridding is the first half of a two-pass
/// run: the convolved pointings are written as `imageC`/`pbC` for external
/// regridding and the run stops there. Otherwise nothing is written until
/// combination has succeeded, so a failed run leaves no FITS output behind.
pub fn run(
    config: &RunConfig,
    reprojector: &dyn Reprojector,
    reporter: &dyn Reporter,
) -> Result<RunSummary, MosaicError> {
    reporter.stage(Stage::Preflight);
    if config.targets.len() < 2 {
        return Err(MosaicError::InsufficientPointings(config.targets.len()));
    }
    let missing = missing_artifacts(&config.targets, |names| names.sources(&config.input_dir));
    if !missing.is_empty() {
        return Err(MosaicError::MissingInputFile { missing });
    }
    let convolve_only = !config.regrid && config.mosaic.resolution.is_some();
    if !config.regrid && !convolve_only {
        let missing =
            missing_artifacts(&config.targets, |names| names.regridded(&config.output_dir));
        if !missing.is_empty() {
            return Err(MosaicError::MissingRegriddedInput { missing });
        }
    }
    reporter.info(format!(
        "All {} images and beams found in {}",
        config.targets.len(),
        config.input_dir.display()
    ));
    fs::create_dir_all(&config.output_dir).map_err(|source| MosaicError::Io {
        path: config.output_dir.clone(),
        source,
    })?;

    if convolve_only {
        return convolve_for_regridding(config, reporter);
    }

    let (regridded, grid, targets, psfs) = if config.regrid {
        let sources = read_sources(config)?;
        check_plane_counts(&sources, config.mosaic.mosaic_type)?;
        let matched = match_resolution(&sources, &config.mosaic, reporter)?;
        let (grid, regridded) = regrid_pointings(&matched.pointings, reprojector, reporter)?;
        let psfs = matched
            .targets
            .as_ref()
            .and_then(|_| mosaic_psfs(&regridded, reporter));
        (regridded, grid, matched.targets, psfs)
    } else {
        reporter.warn(format!(
            "Will use mosaic header {}.hdr and regridded images and beams available on disk, \
             assuming their resolution is acceptable. Enable regridding (and uniform \
             resolution if needed) to redo it",
            config.name
        ));
        let pointings = read_regridded(config)?;
        check_plane_counts(&pointings, config.mosaic.mosaic_type)?;
        let grid = shared_grid(&pointings)?;
        let psfs = common_psfs(&pointings);
        (pointings, grid, None, psfs)
    };

    let output = combine_pointings(&regridded, config.mosaic.cutoff, reporter)?;

    reporter.stage(Stage::Output);
    let mut outputs = if config.regrid {
        write_pointings(
            &config.targets,
            &regridded,
            &config.output_dir,
            |names| (names.regridded_image.clone(), names.regridded_beam.clone()),
            reporter,
        )?
    } else {
        Vec::new()
    };
    let mosaic_path = config.mosaic_path();
    let weights_path = config.weights_path();
    write_mosaic(
        &output,
        &grid,
        regridded[0].spectral(),
        psfs.as_deref(),
        &mosaic_path,
        &weights_path,
    )?;
    reporter.report(RunEvent::ArtifactWritten(mosaic_path.clone()));
    reporter.report(RunEvent::ArtifactWritten(weights_path.clone()));

    let summary_path = config.summary_path();
    outputs.extend([mosaic_path, weights_path, summary_path.clone()]);
    let summary = RunSummary {
        channels: output.image.dim().0,
        coverage: Some(output.coverage()),
        ..summary_for(config, true, targets, psfs, outputs)
    };
    write_summary(&summary, &summary_path, reporter)?;

    Ok(summary)
}

/// First pass of a two-pass run: match resolution and write `imageC`/`pbC`
fn convolve_for_regridding(
    config: &RunConfig,
    reporter: &dyn Reporter,
) -> Result<RunSummary, MosaicError> {
    let sources = read_sources(config)?;
    check_plane_counts(&sources, config.mosaic.mosaic_type)?;
    let matched = match_resolution(&sources, &config.mosaic, reporter)?;
    let psfs = mosaic_psfs(&matched.pointings, reporter);

    reporter.stage(Stage::Output);
    let mut outputs = write_pointings(
        &config.targets,
        &matched.pointings,
        &config.output_dir,
        |names| (names.convolved_image.clone(), names.convolved_beam.clone()),
        reporter,
    )?;
    reporter.warn(format!(
        "Convolved pointings were written as imageC/pbC files and not combined; regrid them \
         to imageR/pbR onto {}.hdr and rerun without uniform resolution to build the mosaic",
        config.name
    ));

    let summary_path = config.summary_path();
    outputs.push(summary_path.clone());
    let summary = RunSummary {
        channels: matched.pointings.first().map_or(0, |p| p.channels()),
        coverage: None,
        ..summary_for(config, false, matched.targets, psfs, outputs)
    };
    write_summary(&summary, &summary_path, reporter)?;

    Ok(summary)
}

fn summary_for(
    config: &RunConfig,
    combined: bool,
    channel_targets: Option<Vec<PsfDescriptor>>,
    mosaic_psfs: Option<Vec<PsfDescriptor>>,
    outputs: Vec<PathBuf>,
) -> RunSummary {
    let resolution = config.mosaic.resolution.as_ref();
    RunSummary {
        name: config.name.clone(),
        mosaic_type: config.mosaic.mosaic_type,
        policy: resolution.map(|r| r.policy),
        circularize: resolution.is_some_and(|r| r.circularize),
        cutoff: config.mosaic.cutoff,
        regridded: config.regrid,
        combined,
        pointings: config.targets.iter().map(|n| n.id.clone()).collect(),
        channel_targets,
        mosaic_psfs,
        channels: 0,
        coverage: None,
        outputs,
    }
}
