//! Reprojection of pointings onto a common mosaic grid
//!
//! The engine only needs two things from a reprojection service: the grid
//! all pointings should land on, and each pointing resampled onto it.
//! [`SharedGridReprojector`] covers pointings that already share one grid;
//! [`MontageReprojector`] drives the Montage toolkit for everything else.

pub mod montage;

pub use montage::MontageReprojector;

use crate::error::MosaicError;
use crate::pointing::{Pointing, SkyGrid};
use ndarray::Axis;

/// Resamples pointings onto a shared sky grid
pub trait Reprojector: Send + Sync {
    /// Grid covering every pointing
    fn common_grid(&self, pointings: &[Pointing]) -> Result<SkyGrid, MosaicError>;

    /// `pointing` resampled onto `grid`, image and beam alike
    fn reproject(&self, pointing: &Pointing, grid: &SkyGrid) -> Result<Pointing, MosaicError>;
}

/// Pass-through for pointings that were imaged on the same grid
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedGridReprojector;

impl Reprojector for SharedGridReprojector {
    fn common_grid(&self, pointings: &[Pointing]) -> Result<SkyGrid, MosaicError> {
        let first = pointings
            .first()
            .ok_or(MosaicError::InsufficientPointings(0))?;
        for pointing in &pointings[1..] {
            if !pointing.grid().matches(first.grid()) {
                return Err(MosaicError::Reprojection {
                    pointing: pointing.id().to_string(),
                    detail: format!(
                        "grid differs from '{}' and in-process reprojection only supports shared grids",
                        first.id()
                    ),
                });
            }
        }
        Ok(first.grid().clone())
    }

    fn reproject(&self, pointing: &Pointing, grid: &SkyGrid) -> Result<Pointing, MosaicError> {
        if pointing.grid().matches(grid) {
            Ok(pointing.clone())
        } else {
            Err(MosaicError::Reprojection {
                pointing: pointing.id().to_string(),
                detail: "pointing is not on the mosaic grid".to_string(),
            })
        }
    }
}

/// Reject a reprojected pointing whose beam misses the grid in some channel
pub fn check_footprint(pointing: &Pointing) -> Result<(), MosaicError> {
    for (channel, plane) in pointing.beam().axis_iter(Axis(0)).enumerate() {
        if !plane.iter().any(|&s| s.is_finite() && s > 0.0) {
            return Err(MosaicError::Reprojection {
                pointing: pointing.id().to_string(),
                detail: format!("channel {channel} does not overlap the mosaic grid"),
            });
        }
    }
    Ok(())
}
