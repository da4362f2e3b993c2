//! Command line arguments for `make_mosaic`

use crate::config::{MosaicConfig, ResolutionConfig, RunConfig, DEFAULT_KERNEL_TOLERANCE_ARCSEC};
use crate::error::MosaicError;
use crate::naming::ArtifactNames;
use crate::pointing::MosaicType;
use crate::psf::PsfDescriptor;
use crate::resolution::{PsfPolicy, DEFAULT_SCALED_TOLERANCE};
use crate::weights::{Cutoff, DEFAULT_CUTOFF};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "make_mosaic",
    about = "Beam-weighted mosaicking of 2D images or spectral cubes",
    long_about = None
)]
pub struct MosaicArgs {
    /// Directory containing the input images and primary beams
    #[arg(short, long, default_value = ".")]
    pub input: PathBuf,

    /// Directory for regridded pointings and mosaic outputs
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Prefix of the output files
    #[arg(short, long, default_value = "mymosaic")]
    pub name: String,

    /// Pointing image to mosaic (repeatable); must end in 'image.fits', its
    /// beam is found by replacing that suffix with 'pb.fits'
    #[arg(short = 't', long = "target-images")]
    pub target_images: Vec<String>,

    /// Combine single planes or cubes channel by channel
    #[arg(short = 'm', long, value_enum)]
    pub mosaic_type: MosaicType,

    /// Regrid images and beams with Montage
    #[arg(short = 'd', long)]
    pub domontage: bool,

    /// Convolve every pointing to a common resolution before mosaicking
    #[arg(short = 'u', long)]
    pub uniform_resolution: bool,

    /// How the common resolution is chosen: auto, uniform or scaled
    #[arg(long, default_value = "auto")]
    pub psf_mode: String,

    /// Forced PSF major axis in arcsec (uniform mode with -u only)
    #[arg(long)]
    pub psf_bmaj: Option<f64>,

    /// Forced PSF minor axis in arcsec, defaults to the major axis
    #[arg(long, requires = "psf_bmaj")]
    pub psf_bmin: Option<f64>,

    /// Forced PSF position angle in degrees, defaults to 0
    #[arg(long, requires = "psf_bmaj")]
    pub psf_bpa: Option<f64>,

    /// Use circular target PSFs and kernels
    #[arg(long)]
    pub circularize: bool,

    /// Relative residual above which a channel is left out of the scaled beam fit
    #[arg(long, default_value_t = DEFAULT_SCALED_TOLERANCE)]
    pub scaled_tolerance: f64,

    /// Primary beam cutoff as a fraction of each pointing's peak, e.g. 0.1 goes down to the 10% level
    #[arg(short, long, default_value_t = DEFAULT_CUTOFF)]
    pub cutoff: f64,

    /// Convolution worker threads (0 uses every hardware thread)
    #[arg(short = 'j', long, default_value_t = 0)]
    pub workers: usize,

    /// Directory containing the Montage executables (default: search PATH)
    #[arg(long)]
    pub montage_bin: Option<PathBuf>,
}

impl MosaicArgs {
    /// Validate everything and build the run configuration.
    ///
    /// Nothing on disk is touched here.
    pub fn into_config(self) -> Result<RunConfig, MosaicError> {
        let cutoff = Cutoff::new(self.cutoff)?;

        if self.target_images.len() < 2 {
            return Err(MosaicError::InsufficientPointings(self.target_images.len()));
        }
        let targets = self
            .target_images
            .iter()
            .map(|t| ArtifactNames::from_target(t))
            .collect::<Result<Vec<_>, _>>()?;

        let forced = match self.psf_bmaj {
            Some(bmaj) => {
                let bmin = self.psf_bmin.unwrap_or(bmaj);
                let bpa = self.psf_bpa.unwrap_or(0.0);
                Some(PsfDescriptor::new(bmaj, bmin, bpa).map_err(|e| {
                    MosaicError::InvalidPsf {
                        context: "--psf-bmaj/--psf-bmin/--psf-bpa".to_string(),
                        detail: e.to_string(),
                    }
                })?)
            }
            None => None,
        };
        let policy = PsfPolicy::from_name(&self.psf_mode, forced, self.scaled_tolerance)?;
        if forced.is_some() {
            let unused = if !self.uniform_resolution {
                Some("resolution matching is off (pass -u)".to_string())
            } else if !matches!(policy, PsfPolicy::Uniform { .. }) {
                Some(format!("only the uniform mode takes a forced PSF, not {}", policy.name()))
            } else {
                None
            };
            if let Some(detail) = unused {
                return Err(MosaicError::InvalidPsf {
                    context: "--psf-bmaj/--psf-bmin/--psf-bpa".to_string(),
                    detail,
                });
            }
        }

        let mut mosaic = MosaicConfig::new(self.mosaic_type, cutoff).with_workers(self.workers);
        mosaic.kernel_tolerance = DEFAULT_KERNEL_TOLERANCE_ARCSEC;
        if self.uniform_resolution {
            mosaic = mosaic.with_resolution(ResolutionConfig {
                policy,
                circularize: self.circularize,
            });
        }

        Ok(RunConfig {
            input_dir: self.input,
            output_dir: self.output,
            name: self.name,
            targets,
            regrid: self.domontage,
            montage_bin: self.montage_bin,
            mosaic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> MosaicArgs {
        let mut argv = vec![
            "make_mosaic",
            "-m",
            "continuum",
            "-t",
            "a.image.fits",
            "-t",
            "b.image.fits",
        ];
        argv.extend_from_slice(extra);
        MosaicArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.name, "mymosaic");
        assert_eq!(config.mosaic.cutoff.value(), 0.1);
        assert_eq!(config.mosaic.workers, 0);
        assert!(config.mosaic.resolution.is_none());
        assert!(!config.regrid);
        assert_eq!(config.targets[1].beam, "b.pb.fits");
        assert_eq!(config.mosaic_path(), PathBuf::from("./mymosaic.fits"));
    }

    #[test]
    fn test_resolution_settings() {
        let config = parse(&[
            "-u",
            "--psf-mode",
            "uniform",
            "--psf-bmaj",
            "20",
            "--psf-bmin",
            "15",
            "--psf-bpa",
            "30",
            "--circularize",
            "-j",
            "4",
        ])
        .into_config()
        .unwrap();

        let resolution = config.mosaic.resolution.unwrap();
        assert!(resolution.circularize);
        assert_eq!(
            resolution.policy,
            PsfPolicy::Uniform {
                forced: Some(PsfDescriptor::new(20.0, 15.0, 30.0).unwrap())
            }
        );
        assert_eq!(config.mosaic.workers, 4);
    }

    #[test]
    fn test_invalid_cutoff_rejected() {
        let err = parse(&["-c", "1.5"]).into_config().unwrap_err();
        assert!(matches!(err, MosaicError::InvalidCutoff(v) if v == 1.5));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let err = parse(&["-u", "--psf-mode", "override"]).into_config().unwrap_err();
        assert!(matches!(err, MosaicError::InvalidPolicy(_)));
    }

    #[test]
    fn test_single_target_rejected() {
        let args = MosaicArgs::try_parse_from(["make_mosaic", "-m", "spectral", "-t", "a.image.fits"])
            .unwrap();
        assert!(matches!(
            args.into_config(),
            Err(MosaicError::InsufficientPointings(1))
        ));
    }

    #[test]
    fn test_bad_target_suffix_rejected() {
        let args = MosaicArgs::try_parse_from([
            "make_mosaic",
            "-m",
            "spectral",
            "-t",
            "a.image.fits",
            "-t",
            "b.fits",
        ])
        .unwrap();
        assert!(matches!(
            args.into_config(),
            Err(MosaicError::InvalidArtifactName(name)) if name == "b.fits"
        ));
    }

    #[test]
    fn test_forced_psf_validated() {
        let err = parse(&["-u", "--psf-mode", "uniform", "--psf-bmaj", "5", "--psf-bmin", "8"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, MosaicError::InvalidPsf { .. }));
    }

    #[test]
    fn test_forced_psf_outside_uniform_mode_rejected() {
        let err = parse(&["-u", "--psf-mode", "auto", "--psf-bmaj", "20"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, MosaicError::InvalidPsf { ref detail, .. } if detail.contains("auto")));

        let err = parse(&["--psf-mode", "uniform", "--psf-bmaj", "20"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, MosaicError::InvalidPsf { ref detail, .. } if detail.contains("-u")));
    }

    #[test]
    fn test_forced_psf_minor_axis_needs_major_axis() {
        let argv = [
            "make_mosaic",
            "-m",
            "continuum",
            "-t",
            "a.image.fits",
            "-t",
            "b.image.fits",
            "--psf-bmin",
            "10",
        ];
        assert!(MosaicArgs::try_parse_from(argv).is_err());
    }
}
