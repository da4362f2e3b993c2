//! Synthetic images for exercising beam and resolution handling.
//!
//! Covariances here are pixel-space standard-deviation covariances
//! `[[σxx, σxy], [σxy, σyy]]`, with x along columns and y along rows.

use ndarray::{Array2, ArrayView2};

/// Render an elliptical Gaussian with peak `amplitude` centred on `(cx, cy)`.
pub fn gaussian_blob(
    shape: (usize, usize),
    center: (f64, f64),
    covariance: [[f64; 2]; 2],
    amplitude: f64,
) -> Array2<f64> {
    let [[sxx, sxy], [_, syy]] = covariance;
    let det = sxx * syy - sxy * sxy;
    assert!(det > 0.0, "covariance must be positive definite");

    let (inv_xx, inv_xy, inv_yy) = (syy / det, -sxy / det, sxx / det);
    let (cx, cy) = center;

    Array2::from_shape_fn(shape, |(y, x)| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        let q = inv_xx * dx * dx + 2.0 * inv_xy * dx * dy + inv_yy * dy * dy;
        amplitude * (-0.5 * q).exp()
    })
}

/// Centroid and second central moments of a non-negative image.
///
/// Returns `((cx, cy), [[mxx, mxy], [mxy, myy]])`; for a well-sampled Gaussian
/// well inside the frame the moment matrix equals its covariance.
pub fn second_moments(image: &ArrayView2<f64>) -> ((f64, f64), [[f64; 2]; 2]) {
    let mut total = 0.0;
    let mut sx = 0.0;
    let mut sy = 0.0;
    for ((y, x), &v) in image.indexed_iter() {
        total += v;
        sx += v * x as f64;
        sy += v * y as f64;
    }
    let (cx, cy) = (sx / total, sy / total);

    let mut m = [[0.0; 2]; 2];
    for ((y, x), &v) in image.indexed_iter() {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        m[0][0] += v * dx * dx;
        m[0][1] += v * dx * dy;
        m[1][1] += v * dy * dy;
    }
    m[0][0] /= total;
    m[0][1] /= total;
    m[1][1] /= total;
    m[1][0] = m[0][1];

    ((cx, cy), m)
}

/// Primary-beam-like sensitivity falling off as a circular Gaussian.
///
/// Peaks at 1.0 on `center`; `fwhm` is in pixels.
pub fn gaussian_primary_beam(shape: (usize, usize), center: (f64, f64), fwhm: f64) -> Array2<f64> {
    let sigma = fwhm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
    gaussian_blob(shape, center, [[sigma * sigma, 0.0], [0.0, sigma * sigma]], 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_moments_recover_covariance() {
        let image = gaussian_blob((64, 64), (31.5, 30.0), [[9.0, 3.0], [3.0, 4.0]], 2.0);
        let ((cx, cy), m) = second_moments(&image.view());

        assert_relative_eq!(cx, 31.5, epsilon = 1e-6);
        assert_relative_eq!(cy, 30.0, epsilon = 1e-6);
        assert_relative_eq!(m[0][0], 9.0, epsilon = 1e-3);
        assert_relative_eq!(m[0][1], 3.0, epsilon = 1e-3);
        assert_relative_eq!(m[1][1], 4.0, epsilon = 1e-3);
    }

    #[test]
    fn test_primary_beam_half_power_at_half_width() {
        let beam = gaussian_primary_beam((1, 41), (20.0, 0.0), 10.0);
        assert_relative_eq!(beam[[0, 20]], 1.0);
        assert_relative_eq!(beam[[0, 25]], 0.5, epsilon = 1e-12);
    }
}
