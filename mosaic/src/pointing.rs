//! Pointings, their sky grids and spectral axes

use crate::error::MosaicError;
use crate::psf::PsfDescriptor;
use clap::ValueEnum;
use ndarray::{Array3, ArrayView2};
use serde::Serialize;

/// Relative tolerance when deciding whether two WCS values describe the same grid
const GRID_TOLERANCE: f64 = 1e-9;

/// How input planes are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MosaicType {
    /// Single 2D plane per pointing
    Continuum,
    /// Cubes combined channel by channel
    Spectral,
}

impl std::fmt::Display for MosaicType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MosaicType::Continuum => write!(f, "continuum"),
            MosaicType::Spectral => write!(f, "spectral"),
        }
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= GRID_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// Linear celestial WCS of the first two image axes (all angles in degrees)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CelestialAxes {
    pub ctype: [String; 2],
    pub crpix: [f64; 2],
    pub crval: [f64; 2],
    pub cdelt: [f64; 2],
}

impl CelestialAxes {
    /// Orthographic RA/Dec grid with RA increasing to the left
    pub fn sine_projection(crval: [f64; 2], crpix: [f64; 2], pixel_scale_arcsec: f64) -> Self {
        let step = pixel_scale_arcsec / 3600.0;
        Self {
            ctype: ["RA---SIN".to_string(), "DEC--SIN".to_string()],
            crpix,
            crval,
            cdelt: [-step, step],
        }
    }

    /// Signed `(CDELT1, CDELT2)` in arcsec
    pub fn pixel_scale_arcsec(&self) -> [f64; 2] {
        [self.cdelt[0] * 3600.0, self.cdelt[1] * 3600.0]
    }

    pub fn matches(&self, other: &CelestialAxes) -> bool {
        self.ctype == other.ctype
            && (0..2).all(|i| {
                close(self.crpix[i], other.crpix[i])
                    && close(self.crval[i], other.crval[i])
                    && close(self.cdelt[i], other.cdelt[i])
            })
    }
}

/// Linear spectral axis; frequencies in the units of the header (usually Hz)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectralAxis {
    pub ctype: String,
    pub crpix: f64,
    pub crval: f64,
    pub cdelt: f64,
}

impl SpectralAxis {
    /// Frequency of 0-based `channel`
    pub fn frequency(&self, channel: usize) -> f64 {
        self.crval + (channel as f64 + 1.0 - self.crpix) * self.cdelt
    }
}

/// Pixel grid on the sky: image size plus celestial WCS
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkyGrid {
    pub rows: usize,
    pub cols: usize,
    pub celestial: CelestialAxes,
}

impl SkyGrid {
    pub fn new(rows: usize, cols: usize, celestial: CelestialAxes) -> Self {
        Self {
            rows,
            cols,
            celestial,
        }
    }

    pub fn matches(&self, other: &SkyGrid) -> bool {
        self.rows == other.rows && self.cols == other.cols && self.celestial.matches(&other.celestial)
    }
}

/// One telescope pointing: image, primary beam and per-channel PSFs on a shared grid.
///
/// Image and beam are `(channel, y, x)` arrays of identical shape. The PSF
/// table is absent when the source carried no beam keywords; anything that
/// needs native resolution asks for it through [`Pointing::psf`].
#[derive(Debug, Clone)]
pub struct Pointing {
    id: String,
    image: Array3<f64>,
    beam: Array3<f64>,
    psfs: Option<Vec<PsfDescriptor>>,
    grid: SkyGrid,
    spectral: Option<SpectralAxis>,
}

impl Pointing {
    pub fn new(
        id: impl Into<String>,
        image: Array3<f64>,
        beam: Array3<f64>,
        psfs: Option<Vec<PsfDescriptor>>,
        grid: SkyGrid,
        spectral: Option<SpectralAxis>,
    ) -> Result<Self, MosaicError> {
        let id = id.into();
        let mismatch = |detail: String| MosaicError::ShapeMismatch {
            pointing: id.clone(),
            detail,
        };

        if image.dim() != beam.dim() {
            return Err(mismatch(format!(
                "image shape {:?} differs from beam shape {:?}",
                image.dim(),
                beam.dim()
            )));
        }
        let (channels, rows, cols) = image.dim();
        if channels == 0 {
            return Err(mismatch("image has no planes".to_string()));
        }
        if (rows, cols) != (grid.rows, grid.cols) {
            return Err(mismatch(format!(
                "image plane {rows}x{cols} differs from its grid {}x{}",
                grid.rows, grid.cols
            )));
        }
        if let Some(psfs) = &psfs {
            if psfs.len() != channels {
                return Err(mismatch(format!(
                    "{} PSF entries for {channels} channels",
                    psfs.len()
                )));
            }
        }

        Ok(Self {
            id,
            image,
            beam,
            psfs,
            grid,
            spectral,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &Array3<f64> {
        &self.image
    }

    pub fn beam(&self) -> &Array3<f64> {
        &self.beam
    }

    pub fn grid(&self) -> &SkyGrid {
        &self.grid
    }

    pub fn spectral(&self) -> Option<&SpectralAxis> {
        self.spectral.as_ref()
    }

    pub fn channels(&self) -> usize {
        self.image.dim().0
    }

    pub fn psfs(&self) -> Option<&[PsfDescriptor]> {
        self.psfs.as_deref()
    }

    /// Native PSF of `channel`
    pub fn psf(&self, channel: usize) -> Result<&PsfDescriptor, MosaicError> {
        self.psfs
            .as_ref()
            .and_then(|psfs| psfs.get(channel))
            .ok_or_else(|| MosaicError::MissingBeamKeywords {
                pointing: self.id.clone(),
                channel,
            })
    }

    pub fn image_plane(&self, channel: usize) -> ArrayView2<'_, f64> {
        self.image.index_axis(ndarray::Axis(0), channel)
    }

    pub fn beam_plane(&self, channel: usize) -> ArrayView2<'_, f64> {
        self.beam.index_axis(ndarray::Axis(0), channel)
    }

    /// Channel frequencies, required by the scaled PSF policy
    pub fn frequencies(&self) -> Result<Vec<f64>, MosaicError> {
        let axis = self
            .spectral
            .as_ref()
            .ok_or_else(|| MosaicError::MissingFrequencyAxis(self.id.clone()))?;
        Ok((0..self.channels()).map(|c| axis.frequency(c)).collect())
    }

    /// Same pointing with new pixel data on a (possibly different) grid
    pub fn with_data(
        &self,
        image: Array3<f64>,
        beam: Array3<f64>,
        psfs: Option<Vec<PsfDescriptor>>,
        grid: SkyGrid,
    ) -> Result<Pointing, MosaicError> {
        Pointing::new(
            self.id.clone(),
            image,
            beam,
            psfs,
            grid,
            self.spectral.clone(),
        )
    }
}

/// Check that a set of pointings can be mosaicked as `mosaic_type`.
///
/// Continuum mosaics need one plane per pointing; spectral mosaics need
/// every pointing to carry the same number of channels.
pub fn check_plane_counts(pointings: &[Pointing], mosaic_type: MosaicType) -> Result<(), MosaicError> {
    let Some(first) = pointings.first() else {
        return Ok(());
    };

    for pointing in pointings {
        match mosaic_type {
            MosaicType::Continuum if pointing.channels() != 1 => {
                return Err(MosaicError::ShapeMismatch {
                    pointing: pointing.id().to_string(),
                    detail: format!(
                        "continuum mosaics need single-plane images, found {} planes",
                        pointing.channels()
                    ),
                });
            }
            MosaicType::Spectral if pointing.channels() != first.channels() => {
                return Err(MosaicError::ShapeMismatch {
                    pointing: pointing.id().to_string(),
                    detail: format!(
                        "{} channels, but '{}' has {}",
                        pointing.channels(),
                        first.id(),
                        first.channels()
                    ),
                });
            }
            _ => {}
        }
    }
    Ok(())
}
