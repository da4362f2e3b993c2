//! Elliptical Gaussian PSF algebra
//!
//! A PSF (or convolution kernel) is described by its FWHM major axis, minor
//! axis (both arcsec) and position angle (degrees, north through east). For
//! composition each descriptor is mapped to a 2×2 "FWHM covariance"
//!
//! ```text
//! C = bmaj² · u·uᵀ + bmin² · v·vᵀ,   u = (sin θ, cos θ),  v = (cos θ, −sin θ)
//! ```
//!
//! in (east, north) sky coordinates. Convolving two Gaussians adds their
//! covariances, so the kernel taking a native PSF `N` to a target `T` is the
//! Gaussian with covariance `C(T) − C(N)`, which exists only when that
//! difference is positive semi-definite.

use nalgebra::Matrix2;
use serde::Serialize;
use shared::image_proc::FWHM_PER_SIGMA;
use std::fmt;
use thiserror::Error;

/// Relative slack on the kernel covariance eigenvalues before a target is
/// considered smaller than the native PSF.
const PSD_RELATIVE_TOLERANCE: f64 = 1e-9;

/// Errors from PSF construction and kernel derivation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PsfError {
    #[error("invalid PSF: {0}")]
    Invalid(String),

    #[error("target PSF {target} is smaller than native PSF {native} along some axis")]
    UnderResolved {
        native: PsfDescriptor,
        target: PsfDescriptor,
    },
}

/// Elliptical Gaussian `{bmaj, bmin, bpa}`; axes in arcsec, angle in degrees.
///
/// Invariant: `bmaj ≥ bmin ≥ 0`, all finite, `bpa` in (−90°, 90°].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PsfDescriptor {
    bmaj: f64,
    bmin: f64,
    bpa: f64,
}

impl PsfDescriptor {
    /// Build a descriptor, rejecting negative, non-finite or swapped axes
    pub fn new(bmaj: f64, bmin: f64, bpa: f64) -> Result<Self, PsfError> {
        if !(bmaj.is_finite() && bmin.is_finite() && bpa.is_finite()) {
            return Err(PsfError::Invalid(format!(
                "non-finite parameters ({bmaj}, {bmin}, {bpa})"
            )));
        }
        if bmin < 0.0 {
            return Err(PsfError::Invalid(format!("negative minor axis {bmin}")));
        }
        if bmaj < bmin {
            return Err(PsfError::Invalid(format!(
                "major axis {bmaj} is smaller than minor axis {bmin}"
            )));
        }

        Ok(Self {
            bmaj,
            bmin,
            bpa: normalize_position_angle(bpa),
        })
    }

    /// Circular Gaussian of the given FWHM
    pub fn circular(fwhm: f64) -> Result<Self, PsfError> {
        Self::new(fwhm, fwhm, 0.0)
    }

    pub fn bmaj(&self) -> f64 {
        self.bmaj
    }

    pub fn bmin(&self) -> f64 {
        self.bmin
    }

    pub fn bpa(&self) -> f64 {
        self.bpa
    }

    /// Copy with `bmin = bmaj` and `bpa = 0`
    pub fn circularized(&self) -> Self {
        Self {
            bmaj: self.bmaj,
            bmin: self.bmaj,
            bpa: 0.0,
        }
    }

    /// True when every axis is below `tolerance` arcsec
    pub fn is_degenerate(&self, tolerance: f64) -> bool {
        self.bmaj <= tolerance
    }

    /// `bmaj · bmin`, proportional to the beam solid angle
    pub fn area(&self) -> f64 {
        self.bmaj * self.bmin
    }

    /// FWHM covariance in (east, north) sky coordinates, arcsec²
    pub fn covariance(&self) -> Matrix2<f64> {
        let theta = self.bpa.to_radians();
        let (s, c) = theta.sin_cos();
        let a2 = self.bmaj * self.bmaj;
        let b2 = self.bmin * self.bmin;

        Matrix2::new(
            a2 * s * s + b2 * c * c,
            (a2 - b2) * s * c,
            (a2 - b2) * s * c,
            a2 * c * c + b2 * s * s,
        )
    }

    /// Recover a descriptor from a FWHM covariance matrix.
    ///
    /// Eigenvalues within `tolerance` below zero are clamped to zero; anything
    /// more negative is not a Gaussian and is rejected.
    pub fn from_covariance(covariance: &Matrix2<f64>, tolerance: f64) -> Result<Self, PsfError> {
        let symmetric = (covariance + covariance.transpose()) * 0.5;
        let eigen = symmetric.symmetric_eigen();

        let (major_idx, minor_idx) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
            (0, 1)
        } else {
            (1, 0)
        };
        let major = eigen.eigenvalues[major_idx];
        let minor = eigen.eigenvalues[minor_idx];

        if minor < -tolerance {
            return Err(PsfError::Invalid(format!(
                "covariance has negative eigenvalue {minor}"
            )));
        }

        let direction = eigen.eigenvectors.column(major_idx);
        let bpa = if (major - minor).abs() <= tolerance {
            0.0
        } else {
            direction[0].atan2(direction[1]).to_degrees()
        };

        Self::new(major.max(0.0).sqrt(), minor.max(0.0).sqrt(), bpa)
    }

    /// Gaussian obtained by convolving `self` with `other`
    pub fn convolved_with(&self, other: &PsfDescriptor) -> PsfDescriptor {
        let sum = self.covariance() + other.covariance();
        let tolerance = PSD_RELATIVE_TOLERANCE * sum.trace().abs().max(f64::MIN_POSITIVE);
        // A sum of two PSD matrices is PSD, so this cannot fail
        Self::from_covariance(&sum, tolerance).unwrap_or(*self)
    }

    /// Standard-deviation covariance in pixel units.
    ///
    /// `cdelt_arcsec` is the signed `(CDELT1, CDELT2)` pixel increment in
    /// arcsec; a pixel step along x moves `CDELT1` in the east direction.
    pub fn pixel_covariance(&self, cdelt_arcsec: [f64; 2]) -> Matrix2<f64> {
        let scale = Matrix2::new(1.0 / cdelt_arcsec[0], 0.0, 0.0, 1.0 / cdelt_arcsec[1]);
        scale * self.covariance() * scale / (FWHM_PER_SIGMA * FWHM_PER_SIGMA)
    }

    /// Inverse of [`PsfDescriptor::pixel_covariance`]
    pub fn from_pixel_covariance(
        covariance: &Matrix2<f64>,
        cdelt_arcsec: [f64; 2],
    ) -> Result<Self, PsfError> {
        let scale = Matrix2::new(cdelt_arcsec[0], 0.0, 0.0, cdelt_arcsec[1]);
        let sky = scale * covariance * scale * (FWHM_PER_SIGMA * FWHM_PER_SIGMA);
        let tolerance = PSD_RELATIVE_TOLERANCE * sky.trace().abs().max(f64::MIN_POSITIVE);
        Self::from_covariance(&sky, tolerance)
    }
}

impl fmt::Display for PsfDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}\"x{:.3}\" @ {:.1}°",
            self.bmaj, self.bmin, self.bpa
        )
    }
}

/// Fold an angle in degrees into (−90, 90]
fn normalize_position_angle(bpa: f64) -> f64 {
    let mut angle = bpa % 180.0;
    if angle <= -90.0 {
        angle += 180.0;
    } else if angle > 90.0 {
        angle -= 180.0;
    }
    angle
}

/// Derive the Gaussian kernel that broadens `native` to `target`.
///
/// The kernel covariance is `C(target) − C(native)`; a negative eigenvalue
/// beyond numerical tolerance means the target is sharper than the native
/// PSF along some direction and fails with [`PsfError::UnderResolved`].
/// With `circularize`, the result is widened to a circle of its own major axis.
pub fn derive_kernel(
    native: &PsfDescriptor,
    target: &PsfDescriptor,
    circularize: bool,
) -> Result<PsfDescriptor, PsfError> {
    let under_resolved = || PsfError::UnderResolved {
        native: *native,
        target: *target,
    };

    if target.bmaj < native.bmaj {
        return Err(under_resolved());
    }

    let difference = target.covariance() - native.covariance();
    let scale = target.covariance().trace().abs().max(f64::MIN_POSITIVE);
    let kernel = PsfDescriptor::from_covariance(&difference, PSD_RELATIVE_TOLERANCE * scale)
        .map_err(|_| under_resolved())?;

    Ok(if circularize {
        kernel.circularized()
    } else {
        kernel
    })
}

/// Gaussian whose covariance dominates every one of `psfs`.
///
/// Starts from the first PSF and grows the covariance by the positive part of
/// each shortfall, so identical inputs give that PSF back. `None` for an
/// empty slice.
pub fn enclosing_psf(psfs: &[PsfDescriptor]) -> Option<PsfDescriptor> {
    let (first, rest) = psfs.split_first()?;
    let mut covariance = first.covariance();
    for psf in rest {
        let mut shortfall = (psf.covariance() - covariance).symmetric_eigen();
        shortfall.eigenvalues = shortfall.eigenvalues.map(|v| v.max(0.0));
        covariance += shortfall.recompose();
    }
    let tolerance = PSD_RELATIVE_TOLERANCE * covariance.trace().abs().max(f64::MIN_POSITIVE);
    PsfDescriptor::from_covariance(&covariance, tolerance).ok()
}
