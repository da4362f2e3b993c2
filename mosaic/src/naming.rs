//! Companion file names derived from a target image name
//!
//! A target `fieldA.image.fits` implies the beam `fieldA.pb.fits`, the
//! regridded pair `fieldA.imageR.fits` / `fieldA.pbR.fits` and the convolved
//! pair `fieldA.imageC.fits` / `fieldA.pbC.fits`.

use crate::error::{ArtifactKind, MissingArtifact, MosaicError};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const IMAGE_SUFFIX: &str = "image.fits";

/// File names belonging to one pointing, relative to the input or output directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactNames {
    pub id: String,
    pub image: String,
    pub beam: String,
    pub regridded_image: String,
    pub regridded_beam: String,
    pub convolved_image: String,
    pub convolved_beam: String,
}

impl ArtifactNames {
    pub fn from_target(target: &str) -> Result<Self, MosaicError> {
        let prefix = target
            .strip_suffix(IMAGE_SUFFIX)
            .ok_or_else(|| MosaicError::InvalidArtifactName(target.to_string()))?;

        let id = Path::new(target)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| MosaicError::InvalidArtifactName(target.to_string()))?
            .to_string();

        Ok(Self {
            id,
            image: target.to_string(),
            beam: format!("{prefix}pb.fits"),
            regridded_image: format!("{prefix}imageR.fits"),
            regridded_beam: format!("{prefix}pbR.fits"),
            convolved_image: format!("{prefix}imageC.fits"),
            convolved_beam: format!("{prefix}pbC.fits"),
        })
    }

    fn artifact(&self, dir: &Path, kind: ArtifactKind) -> (ArtifactKind, PathBuf) {
        let name = match kind {
            ArtifactKind::Image => &self.image,
            ArtifactKind::Beam => &self.beam,
            ArtifactKind::RegriddedImage => &self.regridded_image,
            ArtifactKind::RegriddedBeam => &self.regridded_beam,
        };
        (kind, dir.join(name))
    }

    /// Source image and beam under `input_dir`
    pub fn sources(&self, input_dir: &Path) -> [(ArtifactKind, PathBuf); 2] {
        [
            self.artifact(input_dir, ArtifactKind::Image),
            self.artifact(input_dir, ArtifactKind::Beam),
        ]
    }

    /// Regridded image and beam under `output_dir`
    pub fn regridded(&self, output_dir: &Path) -> [(ArtifactKind, PathBuf); 2] {
        [
            self.artifact(output_dir, ArtifactKind::RegriddedImage),
            self.artifact(output_dir, ArtifactKind::RegriddedBeam),
        ]
    }
}

/// Every listed artifact that does not exist on disk
pub fn missing_artifacts<'a, I>(targets: &'a [ArtifactNames], paths: I) -> Vec<MissingArtifact>
where
    I: Fn(&'a ArtifactNames) -> [(ArtifactKind, PathBuf); 2],
{
    targets
        .iter()
        .flat_map(|names| {
            paths(names)
                .into_iter()
                .map(move |(kind, path)| (names, kind, path))
        })
        .filter(|(_, _, path)| !path.is_file())
        .map(|(names, kind, path)| MissingArtifact {
            pointing: names.id.clone(),
            kind,
            path,
        })
        .collect()
}
