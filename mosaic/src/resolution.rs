//! Target resolution selection
//!
//! Decides, for every (pointing, channel), the PSF that pointing must be
//! convolved to. Three policies are supported:
//!
//! - `auto`: each channel independently takes the largest native beam.
//! - `uniform`: one PSF for every channel, either forced by the user or the
//!   largest native beam anywhere in the data.
//! - `scaled`: channel major axes follow a fitted `bmaj = k / ν` law, which
//!   keeps a few badly flagged channels from dictating the resolution.

use crate::config::ResolutionConfig;
use crate::error::MosaicError;
use crate::pointing::Pointing;
use crate::psf::{derive_kernel, PsfDescriptor};
use crate::report::{Reporter, RunEvent, Stage};
use serde::Serialize;
use std::fmt;

pub const DEFAULT_SCALED_TOLERANCE: f64 = 0.2;

/// Upper bound on outlier-rejection passes in the scaled fit
const MAX_FIT_PASSES: usize = 10;

/// The scaled fit never rejects channels below this count
const MIN_FIT_CHANNELS: usize = 2;

/// Relative shortfall of a fitted beam below the native maximum that is reported
const FLOOR_SLACK: f64 = 1e-9;

/// How target PSFs are chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PsfPolicy {
    Auto,
    Uniform { forced: Option<PsfDescriptor> },
    Scaled { outlier_tolerance: f64 },
}

impl PsfPolicy {
    /// Convert a policy name into a policy.
    ///
    /// `forced` only applies to `uniform`; `scaled_tolerance` only to `scaled`.
    pub fn from_name(
        name: &str,
        forced: Option<PsfDescriptor>,
        scaled_tolerance: f64,
    ) -> Result<Self, MosaicError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PsfPolicy::Auto),
            "uniform" => Ok(PsfPolicy::Uniform { forced }),
            "scaled" => {
                if !(scaled_tolerance.is_finite() && scaled_tolerance > 0.0) {
                    return Err(MosaicError::InvalidPolicy(format!(
                        "scaled (outlier tolerance {scaled_tolerance} must be positive)"
                    )));
                }
                Ok(PsfPolicy::Scaled {
                    outlier_tolerance: scaled_tolerance,
                })
            }
            _ => Err(MosaicError::InvalidPolicy(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PsfPolicy::Auto => "auto",
            PsfPolicy::Uniform { .. } => "uniform",
            PsfPolicy::Scaled { .. } => "scaled",
        }
    }
}

impl fmt::Display for PsfPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsfPolicy::Uniform { forced: Some(psf) } => write!(f, "uniform ({psf})"),
            PsfPolicy::Scaled { outlier_tolerance } => {
                write!(f, "scaled (outlier tolerance {outlier_tolerance})")
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// Target PSF for every (pointing, channel)
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    targets: Vec<Vec<PsfDescriptor>>,
}

impl ResolutionPlan {
    pub fn target(&self, pointing: usize, channel: usize) -> Option<&PsfDescriptor> {
        self.targets.get(pointing).and_then(|row| row.get(channel))
    }

    /// Targets of one pointing, indexed by channel
    pub fn pointing_targets(&self, pointing: usize) -> Option<&[PsfDescriptor]> {
        self.targets.get(pointing).map(|row| row.as_slice())
    }

    pub fn pointings(&self) -> usize {
        self.targets.len()
    }
}

/// Choose target PSFs for every pointing and channel under `config`.
///
/// All pointings must carry native PSFs and the same number of channels.
pub fn select_targets(
    pointings: &[Pointing],
    config: &ResolutionConfig,
    reporter: &dyn Reporter,
) -> Result<ResolutionPlan, MosaicError> {
    reporter.stage(Stage::ResolutionTargets);

    let first = pointings
        .first()
        .ok_or(MosaicError::InsufficientPointings(0))?;
    let channels = first.channels();

    let mut natives = Vec::with_capacity(pointings.len());
    for pointing in pointings {
        if pointing.channels() != channels {
            return Err(MosaicError::ShapeMismatch {
                pointing: pointing.id().to_string(),
                detail: format!(
                    "{} channels, but '{}' has {channels}",
                    pointing.channels(),
                    first.id()
                ),
            });
        }
        let psfs = (0..channels)
            .map(|c| pointing.psf(c).copied())
            .collect::<Result<Vec<_>, _>>()?;
        natives.push(psfs);
    }

    let mut channel_targets = match &config.policy {
        PsfPolicy::Auto => (0..channels)
            .map(|c| largest_in_channel(&natives, c))
            .collect::<Result<Vec<_>, _>>()?,
        PsfPolicy::Uniform { forced: Some(psf) } => vec![*psf; channels],
        PsfPolicy::Uniform { forced: None } => {
            let largest = natives
                .iter()
                .flatten()
                .copied()
                .fold(None, |best: Option<PsfDescriptor>, psf| match best {
                    Some(b) if b.bmaj() >= psf.bmaj() => Some(b),
                    _ => Some(psf),
                })
                .ok_or(MosaicError::InsufficientPointings(0))?;
            vec![largest; channels]
        }
        PsfPolicy::Scaled { outlier_tolerance } => {
            scaled_targets(pointings, &natives, *outlier_tolerance, reporter)?
        }
    };

    if config.circularize {
        channel_targets = channel_targets.iter().map(|t| t.circularized()).collect();
    }

    if config.policy == PsfPolicy::Auto {
        warn_unenclosed(pointings, &natives, &channel_targets, reporter);
    }

    for (channel, target) in channel_targets.iter().enumerate() {
        reporter.report(RunEvent::TargetSelected {
            channel,
            target: *target,
        });
    }

    Ok(ResolutionPlan {
        targets: vec![channel_targets; pointings.len()],
    })
}

/// The auto target keeps the widest beam's orientation, so crossed beams of
/// similar size can stick out of it; convolution then aborts for them.
fn warn_unenclosed(
    pointings: &[Pointing],
    natives: &[Vec<PsfDescriptor>],
    targets: &[PsfDescriptor],
    reporter: &dyn Reporter,
) {
    for (pointing, psfs) in pointings.iter().zip(natives) {
        for (channel, (native, target)) in psfs.iter().zip(targets).enumerate() {
            if derive_kernel(native, target, false).is_err() {
                reporter.warn(format!(
                    "Auto target {target} for channel {channel} does not enclose PSF {native} \
                     of '{}'; force an enclosing PSF with the uniform mode",
                    pointing.id()
                ));
            }
        }
    }
}

/// Largest major axis at `channel` with its position angle, and the largest
/// minor axis capped at that major axis
fn largest_in_channel(
    natives: &[Vec<PsfDescriptor>],
    channel: usize,
) -> Result<PsfDescriptor, MosaicError> {
    let mut widest = natives[0][channel];
    let mut bmin = widest.bmin();
    for psfs in natives {
        let psf = psfs[channel];
        if psf.bmaj() > widest.bmaj() {
            widest = psf;
        }
        bmin = bmin.max(psf.bmin());
    }

    PsfDescriptor::new(widest.bmaj(), bmin.min(widest.bmaj()), widest.bpa()).map_err(|e| {
        MosaicError::InvalidPsf {
            context: format!("auto target for channel {channel}"),
            detail: e.to_string(),
        }
    })
}

fn scaled_targets(
    pointings: &[Pointing],
    natives: &[Vec<PsfDescriptor>],
    tolerance: f64,
    reporter: &dyn Reporter,
) -> Result<Vec<PsfDescriptor>, MosaicError> {
    let channels = natives[0].len();
    let mut coefficient = 0.0_f64;
    let mut frequencies = Vec::new();

    for (pointing, psfs) in pointings.iter().zip(natives) {
        let freqs = pointing.frequencies()?;
        if let Some((channel, &freq)) = freqs
            .iter()
            .enumerate()
            .find(|(_, f)| !(f.is_finite() && **f > 0.0))
        {
            return Err(MosaicError::InvalidPsf {
                context: format!("pointing '{}' channel {channel}", pointing.id()),
                detail: format!("scaled policy needs positive channel frequencies, got {freq}"),
            });
        }

        let bmaj: Vec<f64> = psfs.iter().map(|p| p.bmaj()).collect();
        let fit = fit_inverse_frequency(&freqs, &bmaj, tolerance);
        if fit.rejected() > 0 {
            reporter.info(format!(
                "{}: {} of {channels} channels excluded from the 1/frequency beam fit",
                pointing.id(),
                fit.rejected()
            ));
        }
        coefficient = coefficient.max(fit.coefficient);
        if frequencies.is_empty() {
            frequencies = freqs;
        }
    }

    (0..channels)
        .map(|channel| {
            let auto = largest_in_channel(natives, channel)?;
            let fitted = coefficient / frequencies[channel];
            if fitted < auto.bmaj() * (1.0 - FLOOR_SLACK) {
                reporter.warn(format!(
                    "Channel {channel}: fitted beam {fitted:.3}\" is smaller than the largest native beam {:.3}\", using the native beam",
                    auto.bmaj()
                ));
            }
            let bmaj = fitted.max(auto.bmaj());
            PsfDescriptor::new(bmaj, auto.bmin(), auto.bpa()).map_err(|e| MosaicError::InvalidPsf {
                context: format!("scaled target for channel {channel}"),
                detail: e.to_string(),
            })
        })
        .collect()
}

/// Result of a `bmaj = k / ν` fit
#[derive(Debug, Clone, PartialEq)]
pub struct InverseFrequencyFit {
    pub coefficient: f64,
    /// Per-channel flag, false where the channel was rejected as an outlier
    pub retained: Vec<bool>,
}

impl InverseFrequencyFit {
    pub fn rejected(&self) -> usize {
        self.retained.iter().filter(|&&kept| !kept).count()
    }
}

/// Least-squares fit of `bmaj = k / ν` with iterative outlier rejection.
///
/// Each pass drops channels whose relative residual `|b − k/ν| / (k/ν)`
/// exceeds `tolerance` and refits, stopping when nothing changes, after
/// [`MAX_FIT_PASSES`] passes, or when rejection would leave fewer than
/// [`MIN_FIT_CHANNELS`] channels.
pub fn fit_inverse_frequency(
    frequencies: &[f64],
    bmaj: &[f64],
    tolerance: f64,
) -> InverseFrequencyFit {
    let mut retained = vec![true; frequencies.len()];

    let solve = |retained: &[bool]| {
        let (num, den) = frequencies
            .iter()
            .zip(bmaj)
            .zip(retained)
            .filter(|&(_, &kept)| kept)
            .fold((0.0, 0.0), |(num, den), ((&nu, &b), _)| {
                (num + b / nu, den + 1.0 / (nu * nu))
            });
        if den > 0.0 {
            num / den
        } else {
            0.0
        }
    };

    let mut coefficient = solve(&retained);
    for _ in 0..MAX_FIT_PASSES {
        let next: Vec<bool> = frequencies
            .iter()
            .zip(bmaj)
            .zip(&retained)
            .map(|((&nu, &b), &kept)| {
                let model = coefficient / nu;
                kept && model > 0.0 && ((b - model) / model).abs() <= tolerance
            })
            .collect();

        let kept = next.iter().filter(|&&k| k).count();
        if next == retained || kept < MIN_FIT_CHANNELS {
            break;
        }
        retained = next;
        coefficient = solve(&retained);
    }

    InverseFrequencyFit {
        coefficient,
        retained,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointing::{CelestialAxes, SkyGrid, SpectralAxis};
    use crate::report::CollectingReporter;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn psf(bmaj: f64, bmin: f64, bpa: f64) -> PsfDescriptor {
        PsfDescriptor::new(bmaj, bmin, bpa).unwrap()
    }

    fn pointing(id: &str, psfs: Vec<PsfDescriptor>) -> Pointing {
        let channels = psfs.len();
        Pointing::new(
            id,
            Array3::zeros((channels, 4, 4)),
            Array3::ones((channels, 4, 4)),
            Some(psfs),
            SkyGrid::new(4, 4, CelestialAxes::sine_projection([0.0, 0.0], [2.0, 2.0], 1.0)),
            Some(SpectralAxis {
                ctype: "FREQ".to_string(),
                crpix: 1.0,
                crval: 1.0e9,
                cdelt: 0.1e9,
            }),
        )
        .unwrap()
    }

    fn config(policy: PsfPolicy) -> ResolutionConfig {
        ResolutionConfig {
            policy,
            circularize: false,
        }
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(PsfPolicy::from_name("auto", None, 0.2).unwrap(), PsfPolicy::Auto);
        assert_eq!(
            PsfPolicy::from_name("Uniform", None, 0.2).unwrap(),
            PsfPolicy::Uniform { forced: None }
        );
        assert!(matches!(
            PsfPolicy::from_name("override", None, 0.2),
            Err(MosaicError::InvalidPolicy(name)) if name == "override"
        ));
        assert!(PsfPolicy::from_name("scaled", None, -1.0).is_err());
    }

    #[test]
    fn test_auto_takes_largest_per_channel() {
        let a = pointing("A", vec![psf(10.0, 10.0, 0.0), psf(20.0, 12.0, 30.0)]);
        let b = pointing("B", vec![psf(15.0, 15.0, 0.0), psf(18.0, 17.0, -10.0)]);
        let plan = select_targets(&[a, b], &config(PsfPolicy::Auto), &CollectingReporter::new())
            .unwrap();

        let t0 = plan.target(0, 0).unwrap();
        assert_relative_eq!(t0.bmaj(), 15.0);
        assert_relative_eq!(t0.bmin(), 15.0);

        // Channel 1 keeps its own target: A's 20" beam with the larger minor axis
        let t1 = plan.target(1, 1).unwrap();
        assert_relative_eq!(t1.bmaj(), 20.0);
        assert_relative_eq!(t1.bmin(), 17.0);
        assert_relative_eq!(t1.bpa(), 30.0);
        assert_eq!(plan.target(0, 1), plan.target(1, 1));
    }

    #[test]
    fn test_uniform_uses_global_maximum() {
        let a = pointing("A", vec![psf(10.0, 8.0, 5.0), psf(25.0, 9.0, 40.0)]);
        let b = pointing("B", vec![psf(15.0, 15.0, 0.0), psf(18.0, 17.0, 0.0)]);
        let plan = select_targets(
            &[a, b],
            &config(PsfPolicy::Uniform { forced: None }),
            &CollectingReporter::new(),
        )
        .unwrap();

        for p in 0..2 {
            for c in 0..2 {
                assert_eq!(plan.target(p, c), Some(&psf(25.0, 9.0, 40.0)));
            }
        }
    }

    #[test]
    fn test_uniform_forced_and_circularized() {
        let a = pointing("A", vec![psf(10.0, 8.0, 5.0)]);
        let b = pointing("B", vec![psf(12.0, 6.0, 0.0)]);
        let forced = psf(30.0, 20.0, 45.0);

        let plan = select_targets(
            &[a.clone(), b.clone()],
            &config(PsfPolicy::Uniform {
                forced: Some(forced),
            }),
            &CollectingReporter::new(),
        )
        .unwrap();
        assert_eq!(plan.target(1, 0), Some(&forced));

        let circular = ResolutionConfig {
            policy: PsfPolicy::Uniform { forced: None },
            circularize: true,
        };
        let plan = select_targets(&[a, b], &circular, &CollectingReporter::new()).unwrap();
        assert_eq!(plan.target(0, 0), Some(&PsfDescriptor::circular(12.0).unwrap()));
    }

    #[test]
    fn test_fit_recovers_clean_law() {
        let freqs = [1.0e9, 1.2e9, 1.4e9, 1.6e9];
        let bmaj: Vec<f64> = freqs.iter().map(|f| 1.5e10 / f).collect();
        let fit = fit_inverse_frequency(&freqs, &bmaj, 0.2);
        assert_relative_eq!(fit.coefficient, 1.5e10, max_relative = 1e-12);
        assert_eq!(fit.rejected(), 0);
    }

    #[test]
    fn test_fit_rejects_flagged_channel() {
        let freqs = [1.0e9, 1.1e9, 1.2e9, 1.3e9, 1.4e9];
        let mut bmaj: Vec<f64> = freqs.iter().map(|f| 1.2e10 / f).collect();
        bmaj[2] *= 2.0;

        let fit = fit_inverse_frequency(&freqs, &bmaj, 0.2);
        assert_eq!(fit.retained, vec![true, true, false, true, true]);
        assert_relative_eq!(fit.coefficient, 1.2e10, max_relative = 1e-12);
    }

    #[test]
    fn test_scaled_targets_follow_fit_and_never_deconvolve() {
        // Channel frequencies 1.0, 1.1, 1.2 GHz; clean beams 12/ν(GHz), channel 1 anomalously wide
        let law = |c: usize| 12.0 / (1.0 + 0.1 * c as f64);
        let mut a_psfs: Vec<_> = (0..3).map(|c| psf(law(c), law(c) * 0.8, 0.0)).collect();
        a_psfs[1] = psf(law(1) * 1.5, law(1), 0.0);
        let b_psfs: Vec<_> = (0..3).map(|c| psf(law(c) * 0.9, law(c) * 0.7, 0.0)).collect();

        let reporter = CollectingReporter::new();
        let plan = select_targets(
            &[pointing("A", a_psfs), pointing("B", b_psfs)],
            &config(PsfPolicy::Scaled {
                outlier_tolerance: 0.2,
            }),
            &reporter,
        )
        .unwrap();

        assert_relative_eq!(plan.target(0, 0).unwrap().bmaj(), law(0), max_relative = 1e-9);
        assert_relative_eq!(plan.target(0, 2).unwrap().bmaj(), law(2), max_relative = 1e-9);
        // The outlier channel is floored at its largest native beam
        assert_relative_eq!(plan.target(0, 1).unwrap().bmaj(), law(1) * 1.5, max_relative = 1e-9);
        assert_eq!(reporter.warnings().len(), 1);
    }

    #[test]
    fn test_scaled_needs_spectral_axis() {
        let a = pointing("A", vec![psf(10.0, 10.0, 0.0)]);
        let b = Pointing::new(
            "B",
            a.image().clone(),
            a.beam().clone(),
            a.psfs().map(|p| p.to_vec()),
            a.grid().clone(),
            None,
        )
        .unwrap();

        let result = select_targets(
            &[a, b],
            &config(PsfPolicy::Scaled {
                outlier_tolerance: 0.2,
            }),
            &CollectingReporter::new(),
        );
        assert!(matches!(result, Err(MosaicError::MissingFrequencyAxis(id)) if id == "B"));
    }

    #[test]
    fn test_missing_native_psf_is_reported() {
        let a = pointing("A", vec![psf(10.0, 10.0, 0.0)]);
        let b = Pointing::new(
            "B",
            Array3::zeros((1, 4, 4)),
            Array3::ones((1, 4, 4)),
            None,
            a.grid().clone(),
            None,
        )
        .unwrap();
        let result = select_targets(&[a, b], &config(PsfPolicy::Auto), &CollectingReporter::new());
        assert!(matches!(result, Err(MosaicError::MissingBeamKeywords { pointing, channel: 0 }) if pointing == "B"));
    }

    #[test]
    fn test_auto_target_for_crossed_beams_warns() {
        let pointings = vec![
            pointing("A", vec![psf(20.0, 5.0, 0.0)]),
            pointing("B", vec![psf(19.0, 5.0, 90.0)]),
        ];
        let reporter = CollectingReporter::new();
        let plan = select_targets(&pointings, &config(PsfPolicy::Auto), &reporter).unwrap();

        let target = plan.pointing_targets(1).unwrap()[0];
        assert_relative_eq!(target.bmaj(), 20.0);
        assert_relative_eq!(target.bmin(), 5.0);
        assert!(derive_kernel(pointings[1].psf(0).unwrap(), &target, false).is_err());

        let warnings = reporter.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'B'"));
    }
}
