//! Beam-weighted combination of regridded pointings
//!
//! ```text
//! mosaic[p] = Σ wᵢ[p]·xᵢ[p] / Σ wᵢ[p]      weight[p] = Σ wᵢ[p]
//! ```
//!
//! Pixels that no pointing covers come out as NaN. Channels never mix.

use crate::error::MosaicError;
use crate::pointing::Pointing;
use crate::report::{Reporter, Stage};
use crate::weights::{weight_map, Cutoff};
use ndarray::{Array3, ArrayView3, Zip};

/// Combined image and summed weights, both `(channel, y, x)`
#[derive(Debug, Clone)]
pub struct MosaicOutput {
    pub image: Array3<f64>,
    pub weight: Array3<f64>,
}

impl MosaicOutput {
    /// Fraction of output pixels with any coverage
    pub fn coverage(&self) -> f64 {
        if self.weight.is_empty() {
            return 0.0;
        }
        let covered = self.weight.iter().filter(|&&w| w > 0.0).count();
        covered as f64 / self.weight.len() as f64
    }
}

/// Running weighted sums over pointings
pub struct MosaicAccumulator {
    weighted: Array3<f64>,
    weights: Array3<f64>,
    contributions: usize,
}

impl MosaicAccumulator {
    pub fn new(shape: (usize, usize, usize)) -> Self {
        Self {
            weighted: Array3::zeros(shape),
            weights: Array3::zeros(shape),
            contributions: 0,
        }
    }

    /// Add one pointing's image with its weight map.
    ///
    /// Samples with zero weight or a non-finite image value are skipped.
    pub fn add(
        &mut self,
        pointing: &str,
        image: &ArrayView3<f64>,
        weight: &ArrayView3<f64>,
    ) -> Result<(), MosaicError> {
        let expected = self.weights.dim();
        for (what, dim) in [("image", image.dim()), ("weight map", weight.dim())] {
            if dim != expected {
                return Err(MosaicError::ShapeMismatch {
                    pointing: pointing.to_string(),
                    detail: format!("{what} shape {dim:?} differs from mosaic shape {expected:?}"),
                });
            }
        }

        Zip::from(&mut self.weighted)
            .and(&mut self.weights)
            .and(image)
            .and(weight)
            .for_each(|sum, total, &x, &w| {
                if w > 0.0 && x.is_finite() {
                    *sum += w * x;
                    *total += w;
                }
            });
        self.contributions += 1;
        Ok(())
    }

    pub fn contributions(&self) -> usize {
        self.contributions
    }

    pub fn finish(self) -> MosaicOutput {
        let mut image = self.weighted;
        Zip::from(&mut image)
            .and(&self.weights)
            .for_each(|v, &w| *v = if w > 0.0 { *v / w } else { f64::NAN });

        MosaicOutput {
            image,
            weight: self.weights,
        }
    }
}

/// Combine regridded pointings that share one grid.
///
/// Fails before touching any pixels when fewer than two pointings are given
/// or when their shapes disagree.
pub fn combine_pointings(
    pointings: &[Pointing],
    cutoff: Cutoff,
    reporter: &dyn Reporter,
) -> Result<MosaicOutput, MosaicError> {
    if pointings.len() < 2 {
        return Err(MosaicError::InsufficientPointings(pointings.len()));
    }

    let first = &pointings[0];
    let shape = first.image().dim();
    for pointing in &pointings[1..] {
        if pointing.image().dim() != shape {
            return Err(MosaicError::ShapeMismatch {
                pointing: pointing.id().to_string(),
                detail: format!(
                    "regridded shape {:?} differs from '{}' {:?}",
                    pointing.image().dim(),
                    first.id(),
                    shape
                ),
            });
        }
    }

    reporter.stage(Stage::Combination);
    let mut accumulator = MosaicAccumulator::new(shape);
    for pointing in pointings {
        let weights = weight_map(&pointing.beam().view(), cutoff);
        accumulator.add(pointing.id(), &pointing.image().view(), &weights.view())?;
    }

    let contributions = accumulator.contributions();
    let output = accumulator.finish();
    reporter.info(format!(
        "Combined {contributions} pointings, {:.1}% of the mosaic covered",
        100.0 * output.coverage()
    ));
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointing::{CelestialAxes, SkyGrid};
    use crate::report::CollectingReporter;
    use approx::assert_relative_eq;

    fn flat(id: &str, shape: (usize, usize, usize), value: f64, sensitivity: f64) -> Pointing {
        Pointing::new(
            id,
            Array3::from_elem(shape, value),
            Array3::from_elem(shape, sensitivity),
            None,
            SkyGrid::new(
                shape.1,
                shape.2,
                CelestialAxes::sine_projection([10.0, 20.0], [1.0, 1.0], 1.0),
            ),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_weighted_scenario() {
        let a = flat("A", (1, 4, 4), 10.0, 1.0);
        let b = flat("B", (1, 4, 4), 20.0, 0.5);
        let out = combine_pointings(&[a, b], Cutoff::new(0.1).unwrap(), &CollectingReporter::new())
            .unwrap();

        for &v in out.image.iter() {
            assert_relative_eq!(v, 12.0, epsilon = 1e-12);
        }
        for &w in out.weight.iter() {
            assert_relative_eq!(w, 1.25, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_equal_weights_give_plain_mean() {
        let pointings = vec![
            flat("A", (1, 2, 2), 3.0, 0.7),
            flat("B", (1, 2, 2), 5.0, 0.7),
            flat("C", (1, 2, 2), 10.0, 0.7),
        ];
        let out = combine_pointings(&pointings, Cutoff::default(), &CollectingReporter::new()).unwrap();
        assert_relative_eq!(out.image[[0, 1, 1]], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_uncovered_pixels_are_nan() {
        let mut a = flat("A", (1, 1, 4), 10.0, 1.0);
        let mut beam = a.beam().clone();
        beam[[0, 0, 3]] = 0.0;
        a = a
            .with_data(a.image().clone(), beam, None, a.grid().clone())
            .unwrap();
        let b = a.clone();

        let out = combine_pointings(&[a, b], Cutoff::default(), &CollectingReporter::new()).unwrap();
        assert!(out.image[[0, 0, 3]].is_nan());
        assert_eq!(out.weight[[0, 0, 3]], 0.0);
        assert_relative_eq!(out.image[[0, 0, 0]], 10.0);
        assert_relative_eq!(out.coverage(), 0.75);
    }

    #[test]
    fn test_nan_image_samples_excluded() {
        let mut a = flat("A", (1, 1, 2), 10.0, 1.0);
        let mut image = a.image().clone();
        image[[0, 0, 1]] = f64::NAN;
        a = a
            .with_data(image, a.beam().clone(), None, a.grid().clone())
            .unwrap();
        let b = flat("B", (1, 1, 2), 4.0, 0.5);

        let out = combine_pointings(&[a, b], Cutoff::default(), &CollectingReporter::new()).unwrap();
        assert_relative_eq!(out.image[[0, 0, 1]], 4.0);
        assert_relative_eq!(out.weight[[0, 0, 1]], 0.25);
    }

    #[test]
    fn test_single_pointing_rejected() {
        let a = flat("A", (1, 2, 2), 1.0, 1.0);
        let err = combine_pointings(&[a], Cutoff::default(), &CollectingReporter::new()).unwrap_err();
        assert!(matches!(err, MosaicError::InsufficientPointings(1)));
    }

    #[test]
    fn test_shape_mismatch_names_pointing() {
        let a = flat("A", (1, 2, 2), 1.0, 1.0);
        let b = flat("B", (1, 2, 3), 1.0, 1.0);
        let err = combine_pointings(&[a, b], Cutoff::default(), &CollectingReporter::new()).unwrap_err();
        assert!(matches!(err, MosaicError::ShapeMismatch { pointing, .. } if pointing == "B"));
    }

    #[test]
    fn test_channels_do_not_mix() {
        let mut a = flat("A", (2, 2, 2), 1.0, 1.0);
        let mut image = a.image().clone();
        image.index_axis_mut(ndarray::Axis(0), 1).fill(7.0);
        let mut beam = a.beam().clone();
        // Weaker response in channel 1 only
        beam.index_axis_mut(ndarray::Axis(0), 1).fill(0.2);
        a = a.with_data(image, beam, None, a.grid().clone()).unwrap();
        let b = flat("B", (2, 2, 2), 3.0, 1.0);

        let out = combine_pointings(&[a, b], Cutoff::default(), &CollectingReporter::new()).unwrap();
        assert_relative_eq!(out.image[[0, 0, 0]], 2.0);
        assert_relative_eq!(out.image[[1, 0, 0]], (0.04 * 7.0 + 3.0) / 1.04, epsilon = 1e-12);
    }
}
