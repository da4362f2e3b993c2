//! Sampled elliptical Gaussian kernels
//!
//! Kernels are described by their pixel-space covariance matrix
//! `[[σxx, σxy], [σxy, σyy]]` (x along columns, y along rows) and are
//! normalised to unit sum so convolution preserves total flux.

use nalgebra::Matrix2;
use ndarray::Array2;

/// FWHM of a Gaussian in units of its standard deviation, `2·sqrt(2·ln 2)`
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Kernel half-width in standard deviations
pub const KERNEL_RADIUS_SIGMAS: f64 = 4.0;

/// Variance floor in pixel² applied before inverting a covariance.
///
/// Keeps line-like kernels (one axis ≈ 0) finite; anything this narrow
/// collapses onto a single pixel along that axis.
pub const MIN_PIXEL_VARIANCE: f64 = 1e-6;

/// Sample a unit-sum elliptical Gaussian with the given pixel covariance.
///
/// The kernel is `(2·ry + 1) × (2·rx + 1)` with the peak at the centre pixel,
/// where the radii cover [`KERNEL_RADIUS_SIGMAS`] standard deviations of the
/// marginal spread along each axis (at least one pixel).
pub fn elliptical_gaussian_kernel(covariance: &Matrix2<f64>) -> Array2<f64> {
    let var_x = covariance[(0, 0)].max(MIN_PIXEL_VARIANCE);
    let var_y = covariance[(1, 1)].max(MIN_PIXEL_VARIANCE);
    let cov_xy = covariance[(0, 1)];

    let radius_x = ((KERNEL_RADIUS_SIGMAS * var_x.sqrt()).ceil() as usize).max(1);
    let radius_y = ((KERNEL_RADIUS_SIGMAS * var_y.sqrt()).ceil() as usize).max(1);

    // Keep the matrix positive definite after flooring the diagonal
    let det = (var_x * var_y - cov_xy * cov_xy).max(MIN_PIXEL_VARIANCE * MIN_PIXEL_VARIANCE);
    let inv_xx = var_y / det;
    let inv_yy = var_x / det;
    let inv_xy = -cov_xy / det;

    let mut kernel = Array2::from_shape_fn((2 * radius_y + 1, 2 * radius_x + 1), |(i, j)| {
        let dy = i as f64 - radius_y as f64;
        let dx = j as f64 - radius_x as f64;
        let q = inv_xx * dx * dx + 2.0 * inv_xy * dx * dy + inv_yy * dy * dy;
        (-0.5 * q).exp()
    });

    let sum = kernel.sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|v| v / sum);
    }

    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fwhm_per_sigma() {
        assert_relative_eq!(FWHM_PER_SIGMA, 2.0 * (2.0 * std::f64::consts::LN_2).sqrt(), epsilon = 1e-15);
    }

    #[test]
    fn test_kernel_normalised_and_centred() {
        let kernel = elliptical_gaussian_kernel(&Matrix2::new(4.0, 0.0, 0.0, 1.0));

        assert_relative_eq!(kernel.sum(), 1.0, epsilon = 1e-12);
        assert_eq!(kernel.dim(), (9, 17));

        let peak = kernel[[4, 8]];
        assert!(kernel.iter().all(|&v| v <= peak));
        // Wider along x than along y
        assert!(kernel[[4, 10]] > kernel[[6, 8]]);
    }

    #[test]
    fn test_kernel_second_moments_match_covariance() {
        let covariance = Matrix2::new(6.0, 2.0, 2.0, 3.0);
        let kernel = elliptical_gaussian_kernel(&covariance);
        let (rows, cols) = kernel.dim();
        let (cy, cx) = ((rows / 2) as f64, (cols / 2) as f64);

        let mut m = [0.0; 3];
        for ((i, j), &v) in kernel.indexed_iter() {
            let dx = j as f64 - cx;
            let dy = i as f64 - cy;
            m[0] += v * dx * dx;
            m[1] += v * dx * dy;
            m[2] += v * dy * dy;
        }

        assert_relative_eq!(m[0], 6.0, epsilon = 0.05);
        assert_relative_eq!(m[1], 2.0, epsilon = 0.05);
        assert_relative_eq!(m[2], 3.0, epsilon = 0.05);
    }

    #[test]
    fn test_degenerate_covariance_collapses_to_line() {
        let kernel = elliptical_gaussian_kernel(&Matrix2::new(9.0, 0.0, 0.0, 0.0));

        assert_eq!(kernel.nrows(), 3);
        assert!(kernel.row(0).iter().all(|&v| v < 1e-12));
        assert_relative_eq!(kernel.row(1).sum(), 1.0, epsilon = 1e-12);
    }
}
