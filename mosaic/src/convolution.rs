//! Parallel convolution of pointings to their target resolution
//!
//! Every (pointing, channel) pair is an independent unit: derive the kernel
//! from the native and target PSFs, sample it on the pointing's pixel grid
//! and convolve both the image plane and the primary-beam plane. Units run
//! on a dedicated rayon pool; the first failing unit aborts the whole batch.

use crate::error::MosaicError;
use crate::pointing::Pointing;
use crate::psf::{derive_kernel, PsfDescriptor};
use crate::report::{Reporter, RunEvent, Stage};
use crate::resolution::ResolutionPlan;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use shared::image_proc::{convolve2d, elliptical_gaussian_kernel, ConvolveMethod};

/// One convolved (pointing, channel) unit
#[derive(Debug, Clone)]
pub struct ConvolvedPlane {
    pub image: Array2<f64>,
    pub beam: Array2<f64>,
    /// PSF of the convolved image
    pub psf: PsfDescriptor,
}

/// Worker pool plus the kernel settings shared by every unit
pub struct ConvolutionEngine {
    pool: ThreadPool,
    workers: usize,
    circularize: bool,
    kernel_tolerance: f64,
}

impl ConvolutionEngine {
    /// Build an engine with `workers` threads, or one per hardware thread when 0
    pub fn new(workers: usize, circularize: bool, kernel_tolerance: f64) -> Result<Self, MosaicError> {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("mosaic-convolve-{i}"))
            .build()
            .map_err(|e| MosaicError::WorkerPool(e.to_string()))?;

        Ok(Self {
            pool,
            workers,
            circularize,
            kernel_tolerance,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Convolve every pointing to the targets in `plan`.
    ///
    /// Returns new pointings in input order, each carrying the PSFs its
    /// convolved channels ended up with.
    pub fn convolve_pointings(
        &self,
        pointings: &[Pointing],
        plan: &ResolutionPlan,
        reporter: &dyn Reporter,
    ) -> Result<Vec<Pointing>, MosaicError> {
        reporter.stage(Stage::Convolution);
        reporter.info(format!(
            "Convolving {} pointings on {} worker threads",
            pointings.len(),
            self.workers
        ));

        if plan.pointings() != pointings.len() {
            return Err(MosaicError::ShapeMismatch {
                pointing: pointings
                    .first()
                    .map(|p| p.id().to_string())
                    .unwrap_or_default(),
                detail: format!(
                    "resolution plan covers {} pointings, {} supplied",
                    plan.pointings(),
                    pointings.len()
                ),
            });
        }

        let mut units = Vec::new();
        for (p, pointing) in pointings.iter().enumerate() {
            for channel in 0..pointing.channels() {
                let target = plan
                    .target(p, channel)
                    .ok_or_else(|| MosaicError::ShapeMismatch {
                        pointing: pointing.id().to_string(),
                        detail: format!("no target PSF for channel {channel}"),
                    })?;
                units.push((p, channel, *target));
            }
        }

        let planes = self.pool.install(|| {
            units
                .par_iter()
                .map(|&(p, channel, target)| {
                    let pointing = &pointings[p];
                    let plane = convolve_unit(
                        pointing,
                        channel,
                        &target,
                        self.circularize,
                        self.kernel_tolerance,
                    )?;
                    match &plane.kernel {
                        Some(kernel) => reporter.report(RunEvent::KernelApplied {
                            pointing: pointing.id().to_string(),
                            channel,
                            kernel: *kernel,
                            result: plane.convolved.psf,
                        }),
                        None => reporter.report(RunEvent::PassThrough {
                            pointing: pointing.id().to_string(),
                            channel,
                        }),
                    }
                    Ok(plane.convolved)
                })
                .collect::<Result<Vec<_>, MosaicError>>()
        })?;

        let mut planes = planes.into_iter();
        pointings
            .iter()
            .map(|pointing| {
                let mut image = Array3::zeros(pointing.image().raw_dim());
                let mut beam = Array3::zeros(pointing.beam().raw_dim());
                let mut psfs = Vec::with_capacity(pointing.channels());
                for channel in 0..pointing.channels() {
                    let plane = planes.next().ok_or_else(|| MosaicError::ShapeMismatch {
                        pointing: pointing.id().to_string(),
                        detail: format!("convolution produced no plane for channel {channel}"),
                    })?;
                    image.index_axis_mut(Axis(0), channel).assign(&plane.image);
                    beam.index_axis_mut(Axis(0), channel).assign(&plane.beam);
                    psfs.push(plane.psf);
                }
                pointing.with_data(image, beam, Some(psfs), pointing.grid().clone())
            })
            .collect()
    }
}

/// Output of [`convolve_unit`]: the planes plus the kernel, `None` for pass-through
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub convolved: ConvolvedPlane,
    pub kernel: Option<PsfDescriptor>,
}

/// Convolve one channel of `pointing` from its native PSF to `target`.
///
/// The image plane is rescaled by the ratio of resulting to native beam
/// area so Jy/beam values keep their flux scale; the beam plane is
/// convolved with the unit-sum kernel only. Non-finite pixels are treated as
/// empty and stay non-finite in the output.
pub fn convolve_unit(
    pointing: &Pointing,
    channel: usize,
    target: &PsfDescriptor,
    circularize: bool,
    kernel_tolerance: f64,
) -> Result<UnitResult, MosaicError> {
    let native = *pointing.psf(channel)?;
    let kernel = derive_kernel(&native, target, circularize)
        .map_err(|e| MosaicError::from_psf(pointing.id(), channel, e))?;

    let image = pointing.image_plane(channel);
    let beam = pointing.beam_plane(channel);

    if kernel.is_degenerate(kernel_tolerance) {
        return Ok(UnitResult {
            convolved: ConvolvedPlane {
                image: image.to_owned(),
                beam: beam.to_owned(),
                psf: native,
            },
            kernel: None,
        });
    }

    let pixel_covariance = kernel.pixel_covariance(pointing.grid().celestial.pixel_scale_arcsec());
    let samples = elliptical_gaussian_kernel(&pixel_covariance);

    let result = native.convolved_with(&kernel);
    let flux_scale = if native.area() > 0.0 {
        result.area() / native.area()
    } else {
        1.0
    };

    Ok(UnitResult {
        convolved: ConvolvedPlane {
            image: convolve_masked(&image, &samples.view(), flux_scale),
            beam: convolve_masked(&beam, &samples.view(), 1.0),
            psf: result,
        },
        kernel: Some(kernel),
    })
}

/// Convolve with non-finite pixels zeroed, then put the non-finite values back
fn convolve_masked(plane: &ArrayView2<f64>, kernel: &ArrayView2<f64>, scale: f64) -> Array2<f64> {
    let filled = plane.mapv(|v| if v.is_finite() { v } else { 0.0 });
    let mut out = convolve2d(&filled.view(), kernel, ConvolveMethod::Auto);
    out.zip_mut_with(plane, |o, &v| {
        *o = if v.is_finite() { *o * scale } else { v };
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::pointing::{CelestialAxes, SkyGrid};
    use crate::report::CollectingReporter;
    use crate::resolution::{select_targets, PsfPolicy};
    use approx::assert_relative_eq;
    use test_helpers::synthetic::{gaussian_blob, second_moments};

    const PIXEL_ARCSEC: f64 = 2.0;
    const SIZE: usize = 96;

    fn point_source(id: &str, psf: PsfDescriptor) -> Pointing {
        let grid = SkyGrid::new(
            SIZE,
            SIZE,
            CelestialAxes::sine_projection([180.0, -45.0], [48.0, 48.0], PIXEL_ARCSEC),
        );
        let cov = psf.pixel_covariance(grid.celestial.pixel_scale_arcsec());
        let image = gaussian_blob(
            (SIZE, SIZE),
            (47.0, 47.0),
            [[cov[(0, 0)], cov[(0, 1)]], [cov[(1, 0)], cov[(1, 1)]]],
            1.0,
        );
        let beam = Array2::from_elem((SIZE, SIZE), 1.0);
        Pointing::new(
            id,
            image.insert_axis(Axis(0)),
            beam.insert_axis(Axis(0)),
            Some(vec![psf]),
            grid,
            None,
        )
        .unwrap()
    }

    fn psf(bmaj: f64, bmin: f64, bpa: f64) -> PsfDescriptor {
        PsfDescriptor::new(bmaj, bmin, bpa).unwrap()
    }

    #[test]
    fn test_auto_scenario_kernels() {
        let a = point_source("A", psf(10.0, 10.0, 0.0));
        let b = point_source("B", psf(15.0, 15.0, 0.0));

        let ka = convolve_unit(&a, 0, &psf(15.0, 15.0, 0.0), false, 1e-3).unwrap();
        let kernel = ka.kernel.unwrap();
        assert_relative_eq!(kernel.bmaj(), 11.180_339_887, epsilon = 1e-6);

        let kb = convolve_unit(&b, 0, &psf(15.0, 15.0, 0.0), false, 1e-3).unwrap();
        assert!(kb.kernel.is_none());
        assert_eq!(kb.convolved.image, b.image_plane(0).to_owned());
    }

    #[test]
    fn test_convolved_source_has_target_psf() {
        let native = psf(8.0, 5.0, 30.0);
        let target = psf(14.0, 9.0, 30.0);
        let pointing = point_source("A", native);

        let unit = convolve_unit(&pointing, 0, &target, false, 1e-3).unwrap();
        let ((cx, cy), m) = second_moments(&unit.convolved.image.view());
        assert_relative_eq!(cx, 47.0, epsilon = 1e-6);
        assert_relative_eq!(cy, 47.0, epsilon = 1e-6);

        let expected = target.pixel_covariance([-PIXEL_ARCSEC, PIXEL_ARCSEC]);
        assert_relative_eq!(m[0][0], expected[(0, 0)], max_relative = 2e-3);
        assert_relative_eq!(m[0][1], expected[(0, 1)], max_relative = 2e-3);
        assert_relative_eq!(m[1][1], expected[(1, 1)], max_relative = 2e-3);

        let measured = PsfDescriptor::from_pixel_covariance(
            &nalgebra::Matrix2::new(m[0][0], m[0][1], m[1][0], m[1][1]),
            [-PIXEL_ARCSEC, PIXEL_ARCSEC],
        )
        .unwrap();
        assert_relative_eq!(measured.bmaj(), 14.0, max_relative = 2e-3);
        assert_relative_eq!(measured.bmin(), 9.0, max_relative = 2e-3);
    }

    #[test]
    fn test_flux_scale_preserved_for_jy_per_beam() {
        let native = psf(10.0, 10.0, 0.0);
        let target = psf(20.0, 20.0, 0.0);
        let pointing = point_source("A", native);

        let unit = convolve_unit(&pointing, 0, &target, false, 1e-3).unwrap();
        // A point source keeps its Jy/beam peak when the beam grows
        let peak = unit.convolved.image.iter().copied().fold(f64::MIN, f64::max);
        assert_relative_eq!(peak, 1.0, max_relative = 1e-2);

        // A flat primary beam stays flat away from the edges
        assert_relative_eq!(unit.convolved.beam[[48, 48]], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_nan_pixels_survive_convolution() {
        let mut pointing = point_source("A", psf(10.0, 10.0, 0.0));
        let mut image = pointing.image().clone();
        image[[0, 10, 10]] = f64::NAN;
        pointing = pointing
            .with_data(
                image,
                pointing.beam().clone(),
                pointing.psfs().map(|p| p.to_vec()),
                pointing.grid().clone(),
            )
            .unwrap();

        let unit = convolve_unit(&pointing, 0, &psf(16.0, 16.0, 0.0), false, 1e-3).unwrap();
        assert!(unit.convolved.image[[10, 10]].is_nan());
        assert!(unit.convolved.image[[10, 11]].is_finite());
        assert!(unit.convolved.image.iter().filter(|v| v.is_nan()).count() == 1);
    }

    #[test]
    fn test_under_resolved_unit_fails_whole_batch() {
        let a = point_source("A", psf(10.0, 10.0, 0.0));
        let b = point_source("B", psf(15.0, 15.0, 0.0));
        let plan = select_targets(
            &[a.clone(), b.clone()],
            &ResolutionConfig {
                policy: PsfPolicy::Uniform {
                    forced: Some(psf(12.0, 12.0, 0.0)),
                },
                circularize: false,
            },
            &CollectingReporter::new(),
        )
        .unwrap();

        let engine = ConvolutionEngine::new(2, false, 1e-3).unwrap();
        let err = engine
            .convolve_pointings(&[a, b], &plan, &CollectingReporter::new())
            .unwrap_err();
        assert!(matches!(
            err,
            MosaicError::UnderResolvedTarget { pointing, channel: 0, .. } if pointing == "B"
        ));
    }

    #[test]
    fn test_engine_keeps_order_and_reports_units() {
        let a = point_source("A", psf(10.0, 10.0, 0.0));
        let b = point_source("B", psf(15.0, 15.0, 0.0));
        let pointings = vec![a, b];
        let plan = select_targets(
            &pointings,
            &ResolutionConfig {
                policy: PsfPolicy::Auto,
                circularize: false,
            },
            &CollectingReporter::new(),
        )
        .unwrap();

        let engine = ConvolutionEngine::new(0, false, 1e-3).unwrap();
        assert!(engine.workers() >= 1);
        let reporter = CollectingReporter::new();
        let convolved = engine.convolve_pointings(&pointings, &plan, &reporter).unwrap();

        assert_eq!(convolved[0].id(), "A");
        assert_eq!(convolved[1].id(), "B");
        for pointing in &convolved {
            assert_relative_eq!(pointing.psf(0).unwrap().bmaj(), 15.0, epsilon = 1e-9);
        }
        let events = reporter.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::KernelApplied { pointing, .. } if pointing == "A")));
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::PassThrough { pointing, .. } if pointing == "B")));
    }
}
