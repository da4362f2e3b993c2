//! Validated run configuration
//!
//! Every value here has already passed the checks in
//! [`MosaicArgs::into_config`](crate::args::MosaicArgs::into_config), so the
//! engine never re-validates policy names or cutoffs.

use crate::naming::ArtifactNames;
use crate::pointing::MosaicType;
use crate::resolution::PsfPolicy;
use crate::weights::Cutoff;
use serde::Serialize;
use std::path::PathBuf;

/// Kernels with a major axis below this (arcsec) are treated as identity
pub const DEFAULT_KERNEL_TOLERANCE_ARCSEC: f64 = 1e-3;

/// Resolution matching settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionConfig {
    pub policy: PsfPolicy,
    /// Circularise both target PSFs and derived kernels
    pub circularize: bool,
}

/// Settings of the numerical engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MosaicConfig {
    pub mosaic_type: MosaicType,
    /// `None` keeps every pointing at its native resolution
    pub resolution: Option<ResolutionConfig>,
    pub cutoff: Cutoff,
    /// Convolution worker threads, 0 for all hardware threads
    pub workers: usize,
    pub kernel_tolerance: f64,
}

impl MosaicConfig {
    pub fn new(mosaic_type: MosaicType, cutoff: Cutoff) -> Self {
        Self {
            mosaic_type,
            resolution: None,
            cutoff,
            workers: 0,
            kernel_tolerance: DEFAULT_KERNEL_TOLERANCE_ARCSEC,
        }
    }

    pub fn with_resolution(mut self, resolution: ResolutionConfig) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Everything a file-level run needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Prefix of the mosaic outputs
    pub name: String,
    pub targets: Vec<ArtifactNames>,
    /// Reproject pointings in this run instead of using regridded files on disk
    pub regrid: bool,
    /// Directory holding the Montage executables, `PATH` when unset
    pub montage_bin: Option<PathBuf>,
    pub mosaic: MosaicConfig,
}

impl RunConfig {
    pub fn mosaic_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.fits", self.name))
    }

    pub fn weights_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_weights.fits", self.name))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_summary.json", self.name))
    }

    /// Montage header template of the mosaic grid
    pub fn header_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.hdr", self.name))
    }

    /// Scratch directory for reprojection
    pub fn work_dir(&self) -> PathBuf {
        self.output_dir.join(format!("{}_work", self.name))
    }
}
