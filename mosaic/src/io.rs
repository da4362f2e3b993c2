//! Pointing and mosaic FITS files
//!
//! Maps the header conventions (linear WCS, `BMAJ`/`BMIN`/`BPA` beam
//! keywords with optional per-channel `BMAJn` overrides) onto [`Pointing`]
//! and back. Beam axes are degrees on disk and arcsec in memory.

use crate::combine::MosaicOutput;
use crate::error::MosaicError;
use crate::pointing::{CelestialAxes, Pointing, SkyGrid, SpectralAxis};
use crate::psf::PsfDescriptor;
use ndarray::{Array3, ArrayView3, Axis};
use shared::fits::{write_cube, FitsError, FitsReader, HeaderValue};
use std::path::Path;

const ARCSEC_PER_DEGREE: f64 = 3600.0;

type Header = Vec<(String, HeaderValue)>;

/// Read a pointing from its image and primary-beam files.
///
/// A single-plane beam is broadcast over every channel of a cube.
pub fn read_pointing(id: &str, image_path: &Path, beam_path: &Path) -> Result<Pointing, MosaicError> {
    let mut reader = FitsReader::open(image_path)?;
    let image = reader.read_cube()?;
    let (channels, rows, cols) = image.dim();

    let celestial = read_celestial(&mut reader)?;
    let spectral = read_spectral(&mut reader);
    let psfs = read_psfs(&mut reader, id, channels)?;

    let mut beam_reader = FitsReader::open(beam_path)?;
    let mut beam = beam_reader.read_cube()?;
    if beam.dim().0 == 1 && channels > 1 && beam.dim().1 == rows && beam.dim().2 == cols {
        let plane = beam.index_axis(Axis(0), 0).to_owned();
        beam = plane
            .broadcast((channels, rows, cols))
            .map(|view| view.to_owned())
            .unwrap_or(beam);
    }

    Pointing::new(
        id,
        image,
        beam,
        psfs,
        SkyGrid::new(rows, cols, celestial),
        spectral,
    )
}

fn axis_increment(reader: &mut FitsReader, axis: usize) -> Result<f64, FitsError> {
    reader
        .read_float(&format!("CDELT{axis}"))
        .or_else(|| reader.read_float(&format!("CD{axis}_{axis}")))
        .ok_or_else(|| FitsError::MissingKeyword {
            path: reader.path().to_path_buf(),
            key: format!("CDELT{axis}"),
        })
}

fn read_celestial(reader: &mut FitsReader) -> Result<CelestialAxes, FitsError> {
    let mut axes = CelestialAxes {
        ctype: [String::new(), String::new()],
        crpix: [0.0; 2],
        crval: [0.0; 2],
        cdelt: [0.0; 2],
    };
    for i in 0..2 {
        let n = i + 1;
        axes.ctype[i] = reader.read_text(&format!("CTYPE{n}")).unwrap_or_default();
        axes.crpix[i] = reader.require_float(&format!("CRPIX{n}"))?;
        axes.crval[i] = reader.require_float(&format!("CRVAL{n}"))?;
        axes.cdelt[i] = axis_increment(reader, n)?;
    }
    Ok(axes)
}

/// Spectral axis: axis 3, or axis 4 when only that one is non-degenerate
fn read_spectral(reader: &mut FitsReader) -> Option<SpectralAxis> {
    let n = match reader.shape() {
        [_, _, _] => 3,
        [outer, planes, _, _] if *planes == 1 && *outer > 1 => 4,
        [_, _, _, _] => 3,
        _ => return None,
    };

    let crval = reader.read_float(&format!("CRVAL{n}"))?;
    let cdelt = axis_increment(reader, n).ok()?;
    Some(SpectralAxis {
        ctype: reader
            .read_text(&format!("CTYPE{n}"))
            .unwrap_or_else(|| "FREQ".to_string()),
        crpix: reader.read_float(&format!("CRPIX{n}")).unwrap_or(1.0),
        crval,
        cdelt,
    })
}

/// Per-channel beams, `None` when the file has no beam keywords at all
fn read_psfs(
    reader: &mut FitsReader,
    id: &str,
    channels: usize,
) -> Result<Option<Vec<PsfDescriptor>>, MosaicError> {
    let mut found = Vec::with_capacity(channels);
    for channel in 0..channels {
        let mut key = |name: &str| {
            reader
                .read_float(&format!("{name}{}", channel + 1))
                .or_else(|| reader.read_float(name))
        };
        let bmaj = key("BMAJ");
        let bmin = key("BMIN");
        let bpa = key("BPA").unwrap_or(0.0);
        found.push(match (bmaj, bmin) {
            (Some(bmaj), Some(bmin)) => Some(beam_from_header(id, channel, bmaj, bmin, bpa)?),
            _ => None,
        });
    }

    if found.iter().all(Option::is_none) {
        return Ok(None);
    }
    found
        .into_iter()
        .enumerate()
        .map(|(channel, psf)| {
            psf.ok_or_else(|| MosaicError::MissingBeamKeywords {
                pointing: id.to_string(),
                channel,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Some writers store the axes swapped; those describe the same ellipse
/// rotated by 90°.
fn beam_from_header(
    id: &str,
    channel: usize,
    bmaj_deg: f64,
    bmin_deg: f64,
    bpa: f64,
) -> Result<PsfDescriptor, MosaicError> {
    let (major, minor, angle) = if bmin_deg > bmaj_deg {
        (bmin_deg, bmaj_deg, bpa + 90.0)
    } else {
        (bmaj_deg, bmin_deg, bpa)
    };
    PsfDescriptor::new(major * ARCSEC_PER_DEGREE, minor * ARCSEC_PER_DEGREE, angle)
        .map_err(|e| MosaicError::from_psf(id, channel, e))
}

fn wcs_header(grid: &SkyGrid, spectral: Option<&SpectralAxis>) -> Header {
    let mut header = Header::new();
    let axes = &grid.celestial;
    for i in 0..2 {
        let n = i + 1;
        header.push((format!("CTYPE{n}"), axes.ctype[i].clone().into()));
        header.push((format!("CRPIX{n}"), axes.crpix[i].into()));
        header.push((format!("CRVAL{n}"), axes.crval[i].into()));
        header.push((format!("CDELT{n}"), axes.cdelt[i].into()));
    }
    if let Some(axis) = spectral {
        header.push(("CTYPE3".to_string(), axis.ctype.clone().into()));
        header.push(("CRPIX3".to_string(), axis.crpix.into()));
        header.push(("CRVAL3".to_string(), axis.crval.into()));
        header.push(("CDELT3".to_string(), axis.cdelt.into()));
    }
    header
}

/// Global beam from the first channel, per-channel keywords when channels differ
fn beam_header(psfs: &[PsfDescriptor]) -> Header {
    let mut header = Header::new();
    let Some(first) = psfs.first() else {
        return header;
    };
    let mut push = |suffix: String, psf: &PsfDescriptor| {
        header.push((format!("BMAJ{suffix}"), (psf.bmaj() / ARCSEC_PER_DEGREE).into()));
        header.push((format!("BMIN{suffix}"), (psf.bmin() / ARCSEC_PER_DEGREE).into()));
        header.push((format!("BPA{suffix}"), psf.bpa().into()));
    };

    push(String::new(), first);
    if psfs.iter().any(|psf| psf != first) {
        for (channel, psf) in psfs.iter().enumerate() {
            push((channel + 1).to_string(), psf);
        }
    }
    header
}

fn write_plane_set(
    path: &Path,
    data: &ArrayView3<f64>,
    mut header: Header,
    extra: Header,
) -> Result<(), MosaicError> {
    header.extend(extra);
    write_cube(path, data, data.dim().0 == 1, &header)?;
    Ok(())
}

/// Write a pointing's image (with its beam keywords) and primary beam.
///
/// Single-plane pointings are written as 2D images.
pub fn write_pointing(pointing: &Pointing, image_path: &Path, beam_path: &Path) -> Result<(), MosaicError> {
    let spectral = pointing.spectral().filter(|_| pointing.channels() > 1);
    let wcs = wcs_header(pointing.grid(), spectral);
    let beams = pointing.psfs().map(beam_header).unwrap_or_default();

    write_plane_set(image_path, &pointing.image().view(), wcs.clone(), beams)?;
    write_plane_set(beam_path, &pointing.beam().view(), wcs, Header::new())
}

/// Write the combined image and the summed weights
pub fn write_mosaic(
    output: &MosaicOutput,
    grid: &SkyGrid,
    spectral: Option<&SpectralAxis>,
    psfs: Option<&[PsfDescriptor]>,
    image_path: &Path,
    weight_path: &Path,
) -> Result<(), MosaicError> {
    let spectral = spectral.filter(|_| output.image.dim().0 > 1);
    let wcs = wcs_header(grid, spectral);
    let beams = psfs.map(beam_header).unwrap_or_default();

    write_plane_set(image_path, &output.image.view(), wcs.clone(), beams)?;
    write_plane_set(weight_path, &output.weight.view(), wcs, Header::new())
}

/// Image read back without a beam file, used for weight maps and mosaics
pub fn read_image(path: &Path) -> Result<Array3<f64>, MosaicError> {
    Ok(FitsReader::open(path)?.read_cube()?)
}
