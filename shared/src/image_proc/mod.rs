//! Image processing primitives shared across the workspace
//!
//! Convolution and kernel construction that know nothing about pointings,
//! beams or sky coordinates.

pub mod convolve2d;
pub mod gaussian;

pub use convolve2d::{convolve2d, ConvolveMethod};
pub use gaussian::{elliptical_gaussian_kernel, FWHM_PER_SIGMA};
