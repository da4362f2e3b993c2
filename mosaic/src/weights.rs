//! Beam-squared weight maps with a sensitivity cutoff

use crate::error::MosaicError;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use serde::Serialize;

pub const DEFAULT_CUTOFF: f64 = 0.1;

/// Fraction of the per-channel peak sensitivity below which a pointing is ignored.
///
/// Always strictly between 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Cutoff(f64);

impl Cutoff {
    pub fn new(value: f64) -> Result<Self, MosaicError> {
        if value > 0.0 && value < 1.0 {
            Ok(Self(value))
        } else {
            Err(MosaicError::InvalidCutoff(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for Cutoff {
    fn default() -> Self {
        Self(DEFAULT_CUTOFF)
    }
}

/// Weight plane for one channel: `s²` where `s ≥ cutoff · max(s)`, zero elsewhere.
///
/// Non-finite samples never contribute. A plane with no positive sensitivity
/// yields all-zero weights.
pub fn weight_plane(sensitivity: &ArrayView2<f64>, cutoff: Cutoff) -> Array2<f64> {
    let peak = sensitivity
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);

    if peak <= 0.0 {
        return Array2::zeros(sensitivity.raw_dim());
    }

    let threshold = cutoff.value() * peak;
    sensitivity.mapv(|s| if s.is_finite() && s >= threshold { s * s } else { 0.0 })
}

/// Weights for every channel of a `(channel, y, x)` sensitivity cube
pub fn weight_map(sensitivity: &ArrayView3<f64>, cutoff: Cutoff) -> Array3<f64> {
    let mut weights = Array3::zeros(sensitivity.raw_dim());
    for (mut out, plane) in weights
        .axis_iter_mut(Axis(0))
        .zip(sensitivity.axis_iter(Axis(0)))
    {
        out.assign(&weight_plane(&plane, cutoff));
    }
    weights
}
