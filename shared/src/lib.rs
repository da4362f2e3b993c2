//! Shared components and utilities for the mosaicking workspace
//!
//! Array-level building blocks (convolution, Gaussian kernels) and the FITS
//! cube reader/writer used by the `mosaic` crate.

pub mod image_proc;

#[cfg(feature = "fits-io")]
pub mod fits;
