//! Failure taxonomy for a mosaicking run
//!
//! Every variant is terminal for the run and names the pointing, channel or
//! setting responsible.

use crate::psf::{PsfDescriptor, PsfError};
use shared::fits::FitsError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which file of a pointing an artifact refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Beam,
    RegriddedImage,
    RegriddedBeam,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Image => write!(f, "image"),
            ArtifactKind::Beam => write!(f, "primary beam"),
            ArtifactKind::RegriddedImage => write!(f, "regridded image"),
            ArtifactKind::RegriddedBeam => write!(f, "regridded primary beam"),
        }
    }
}

/// A file the run needs but could not find
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingArtifact {
    pub pointing: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

impl fmt::Display for MissingArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of pointing '{}' ({})",
            self.kind,
            self.pointing,
            self.path.display()
        )
    }
}

fn list_missing(missing: &[MissingArtifact]) -> String {
    missing
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that abort a mosaicking run
#[derive(Error, Debug)]
pub enum MosaicError {
    #[error("unknown PSF policy '{0}' (expected one of: auto, uniform, scaled)")]
    InvalidPolicy(String),

    #[error(
        "pointing '{pointing}' channel {channel}: target PSF {target} is smaller than native PSF {native}"
    )]
    UnderResolvedTarget {
        pointing: String,
        channel: usize,
        native: PsfDescriptor,
        target: PsfDescriptor,
    },

    #[error("cutoff {0} is outside the open interval (0, 1)")]
    InvalidCutoff(f64),

    #[error("at least two pointings are required for mosaicking, got {0}")]
    InsufficientPointings(usize),

    #[error("missing regridded inputs: {}", list_missing(.missing))]
    MissingRegriddedInput { missing: Vec<MissingArtifact> },

    #[error("pointing '{pointing}': shape mismatch: {detail}")]
    ShapeMismatch { pointing: String, detail: String },

    #[error("missing input files: {}", list_missing(.missing))]
    MissingInputFile { missing: Vec<MissingArtifact> },

    #[error("invalid PSF for {context}: {detail}")]
    InvalidPsf { context: String, detail: String },

    #[error("pointing '{pointing}' has no BMAJ/BMIN/BPA beam keywords for channel {channel}")]
    MissingBeamKeywords { pointing: String, channel: usize },

    #[error("pointing '{0}' has no spectral axis; the scaled PSF policy needs channel frequencies")]
    MissingFrequencyAxis(String),

    #[error("target image name '{0}' does not end with 'image.fits'")]
    InvalidArtifactName(String),

    #[error("reprojection of pointing '{pointing}' failed: {detail}")]
    Reprojection { pointing: String, detail: String },

    #[error("failed to start convolution worker pool: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialise run summary: {0}")]
    Summary(#[from] serde_json::Error),
}

impl MosaicError {
    /// Attach the offending pointing and channel to a PSF algebra failure
    pub fn from_psf(pointing: &str, channel: usize, err: PsfError) -> Self {
        match err {
            PsfError::UnderResolved { native, target } => MosaicError::UnderResolvedTarget {
                pointing: pointing.to_string(),
                channel,
                native,
                target,
            },
            PsfError::Invalid(detail) => MosaicError::InvalidPsf {
                context: format!("pointing '{pointing}' channel {channel}"),
                detail,
            },
        }
    }
}
