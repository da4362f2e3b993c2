//! Reprojection through the Montage toolkit
//!
//! `mImgtbl` + `mMakeHdr` derive the mosaic header from the pointing
//! footprints; `mProject` (planes) or `mProjectCube` (cubes) resample each
//! image and beam onto it. All intermediate files live in a scratch
//! directory; the derived header is kept next to the mosaic outputs.

use super::Reprojector;
use crate::error::MosaicError;
use crate::io::{read_pointing, write_pointing};
use crate::pointing::{CelestialAxes, Pointing, SkyGrid};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Label used in errors that concern the mosaic as a whole
const MOSAIC_HEADER: &str = "mosaic header";

/// Montage-backed [`Reprojector`]
#[derive(Debug, Clone)]
pub struct MontageReprojector {
    bin_dir: Option<PathBuf>,
    work_dir: PathBuf,
    header_path: PathBuf,
}

impl MontageReprojector {
    /// Work in `work_dir`, writing the derived mosaic header to `header_path`
    pub fn new(work_dir: impl Into<PathBuf>, header_path: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: None,
            work_dir: work_dir.into(),
            header_path: header_path.into(),
        }
    }

    /// Look for the Montage executables in `dir` instead of on `PATH`
    pub fn with_bin_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.bin_dir = dir;
        self
    }

    fn tool_path(&self, tool: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    fn ensure_dir(&self, dir: &Path) -> Result<(), MosaicError> {
        fs::create_dir_all(dir).map_err(|source| MosaicError::Io {
            path: dir.to_path_buf(),
            source,
        })
    }

    fn run(&self, pointing: &str, tool: &str, args: &[&OsStr]) -> Result<(), MosaicError> {
        let mut cmd = Command::new(self.tool_path(tool));
        cmd.args(args);
        log::debug!("Running {cmd:?}");

        let output = cmd.output().map_err(|e| MosaicError::Reprojection {
            pointing: pointing.to_string(),
            detail: format!("failed to start {tool}: {e}"),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || stdout.contains("stat=\"ERROR\"") {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MosaicError::Reprojection {
                pointing: pointing.to_string(),
                detail: format!(
                    "{tool} failed ({}): {} {}",
                    output.status,
                    stdout.trim(),
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

impl Reprojector for MontageReprojector {
    fn common_grid(&self, pointings: &[Pointing]) -> Result<SkyGrid, MosaicError> {
        let footprints = self.work_dir.join("footprints");
        if footprints.exists() {
            fs::remove_dir_all(&footprints).map_err(|source| MosaicError::Io {
                path: footprints.clone(),
                source,
            })?;
        }
        self.ensure_dir(&footprints)?;

        for pointing in pointings {
            write_pointing(
                pointing,
                &footprints.join(format!("{}.fits", pointing.id())),
                &self.work_dir.join(format!("{}.footprint_pb.fits", pointing.id())),
            )?;
        }

        let table = self.work_dir.join("images.tbl");
        self.run(
            MOSAIC_HEADER,
            "mImgtbl",
            &[footprints.as_os_str(), table.as_os_str()],
        )?;
        if let Some(parent) = self.header_path.parent() {
            self.ensure_dir(parent)?;
        }
        self.run(
            MOSAIC_HEADER,
            "mMakeHdr",
            &[table.as_os_str(), self.header_path.as_os_str()],
        )?;

        let text = fs::read_to_string(&self.header_path).map_err(|source| MosaicError::Io {
            path: self.header_path.clone(),
            source,
        })?;
        parse_header_template(&text).map_err(|detail| MosaicError::Reprojection {
            pointing: MOSAIC_HEADER.to_string(),
            detail,
        })
    }

    fn reproject(&self, pointing: &Pointing, grid: &SkyGrid) -> Result<Pointing, MosaicError> {
        self.ensure_dir(&self.work_dir)?;
        let id = pointing.id();

        let template = self.work_dir.join("grid.hdr");
        fs::write(&template, render_header_template(grid)).map_err(|source| MosaicError::Io {
            path: template.clone(),
            source,
        })?;

        let in_image = self.work_dir.join(format!("{id}.in.fits"));
        let in_beam = self.work_dir.join(format!("{id}.in_pb.fits"));
        let out_image = self.work_dir.join(format!("{id}.out.fits"));
        let out_beam = self.work_dir.join(format!("{id}.out_pb.fits"));
        write_pointing(pointing, &in_image, &in_beam)?;

        let tool = if pointing.channels() > 1 {
            "mProjectCube"
        } else {
            "mProject"
        };
        for (input, output) in [(&in_image, &out_image), (&in_beam, &out_beam)] {
            self.run(
                id,
                tool,
                &[
                    OsStr::new("-f"),
                    input.as_os_str(),
                    output.as_os_str(),
                    template.as_os_str(),
                ],
            )?;
        }

        let resampled = read_pointing(id, &out_image, &out_beam)?;
        if (resampled.grid().rows, resampled.grid().cols) != (grid.rows, grid.cols) {
            return Err(MosaicError::Reprojection {
                pointing: id.to_string(),
                detail: format!(
                    "{tool} produced a {}x{} image for a {}x{} grid",
                    resampled.grid().rows,
                    resampled.grid().cols,
                    grid.rows,
                    grid.cols
                ),
            });
        }

        pointing.with_data(
            resampled.image().clone(),
            resampled.beam().clone(),
            pointing.psfs().map(|psfs| psfs.to_vec()),
            grid.clone(),
        )
    }
}

/// Value part of a `KEY = value / comment` header line
fn card_value(rest: &str) -> String {
    let rest = rest.trim();
    if let Some(quoted) = rest.strip_prefix('\'') {
        return quoted
            .split('\'')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
    }
    rest.split('/').next().unwrap_or_default().trim().to_string()
}

/// Parse a Montage header template into a grid
pub fn parse_header_template(text: &str) -> Result<SkyGrid, String> {
    let cards: HashMap<String, String> = text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, rest)| (key.trim().to_ascii_uppercase(), card_value(rest)))
        .collect();

    let text_card = |key: &str| {
        cards
            .get(key)
            .cloned()
            .ok_or_else(|| format!("header template has no {key}"))
    };
    let float_card = |key: &str| {
        text_card(key)?
            .parse::<f64>()
            .map_err(|_| format!("header template {key} is not a number"))
    };
    let size_card = |key: &str| {
        text_card(key)?
            .parse::<usize>()
            .map_err(|_| format!("header template {key} is not a size"))
    };

    Ok(SkyGrid::new(
        size_card("NAXIS2")?,
        size_card("NAXIS1")?,
        CelestialAxes {
            ctype: [text_card("CTYPE1")?, text_card("CTYPE2")?],
            crpix: [float_card("CRPIX1")?, float_card("CRPIX2")?],
            crval: [float_card("CRVAL1")?, float_card("CRVAL2")?],
            cdelt: [float_card("CDELT1")?, float_card("CDELT2")?],
        },
    ))
}

/// Render a grid as a Montage header template
pub fn render_header_template(grid: &SkyGrid) -> String {
    let axes = &grid.celestial;
    let cards = [
        ("SIMPLE", "T".to_string()),
        ("BITPIX", "-64".to_string()),
        ("NAXIS", "2".to_string()),
        ("NAXIS1", grid.cols.to_string()),
        ("NAXIS2", grid.rows.to_string()),
        ("CTYPE1", format!("'{}'", axes.ctype[0])),
        ("CTYPE2", format!("'{}'", axes.ctype[1])),
        ("CRVAL1", axes.crval[0].to_string()),
        ("CRVAL2", axes.crval[1].to_string()),
        ("CRPIX1", axes.crpix[0].to_string()),
        ("CRPIX2", axes.crpix[1].to_string()),
        ("CDELT1", axes.cdelt[0].to_string()),
        ("CDELT2", axes.cdelt[1].to_string()),
        ("EQUINOX", "2000.0".to_string()),
    ];

    let mut text: String = cards
        .iter()
        .map(|(key, value)| format!("{key:<8}= {value}\n"))
        .collect();
    text.push_str("END\n");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::TempDir;

    #[test]
    fn test_parse_make_hdr_output() {
        let text = "\
SIMPLE  = T
BITPIX  = -64
NAXIS   = 2
NAXIS1  = 3001
NAXIS2  = 2874
CTYPE1  = 'RA---SIN'
CTYPE2  = 'DEC--SIN'
EQUINOX = 2000
CRVAL1  =  52.500000000
CRVAL2  = -28.000000000
CRPIX1  =    1501.0000
CRPIX2  =    1437.5000
CDELT1  =  -0.000555556   / degrees per pixel
CDELT2  =   0.000555556
CROTA2  =   0.000000000
END
";
        let grid = parse_header_template(text).unwrap();
        assert_eq!((grid.rows, grid.cols), (2874, 3001));
        assert_eq!(grid.celestial.ctype[1], "DEC--SIN");
        assert_eq!(grid.celestial.crpix, [1501.0, 1437.5]);
        assert_eq!(grid.celestial.cdelt[0], -0.000555556);
    }

    #[test]
    fn test_rendered_template_parses_back() {
        let grid = SkyGrid::new(
            120,
            96,
            CelestialAxes::sine_projection([83.8221, -5.3911], [48.5, 60.5], 2.5),
        );
        let parsed = parse_header_template(&render_header_template(&grid)).unwrap();
        assert_eq!(parsed, grid);
    }

    #[test]
    fn test_incomplete_template_names_missing_key() {
        let err = parse_header_template("NAXIS1 = 10\nNAXIS2 = 10\n").unwrap_err();
        assert!(err.contains("CTYPE1"));
    }

    #[test]
    fn test_missing_tools_fail_with_reprojection_error() {
        let dir = TempDir::new().unwrap();
        let reprojector = MontageReprojector::new(dir.path().join("work"), dir.path().join("m.hdr"))
            .with_bin_dir(Some(dir.path().join("no-montage-here")));

        let pointing = Pointing::new(
            "p1",
            Array3::zeros((1, 4, 4)),
            Array3::ones((1, 4, 4)),
            None,
            SkyGrid::new(4, 4, CelestialAxes::sine_projection([0.0, 0.0], [2.0, 2.0], 1.0)),
            None,
        )
        .unwrap();

        let err = reprojector.common_grid(&[pointing.clone(), pointing]).unwrap_err();
        match err {
            MosaicError::Reprojection { detail, .. } => assert!(detail.contains("mImgtbl")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
