//! FITS image cube reading and writing
//!
//! Reads the primary image HDU of a FITS file into an `Array3<f64>` laid out
//! as `(plane, y, x)` in FITS storage order, and writes cubes back with an
//! arbitrary set of header keywords. 2D images read as a single plane; 4D
//! images are accepted when at least one of the two outer axes is degenerate.

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::{Array3, ArrayView3};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during FITS file operations
#[derive(Error, Debug)]
pub enum FitsError {
    #[error("FITS I/O error in {path}: {source}")]
    FitsIo {
        path: PathBuf,
        #[source]
        source: fitsio::errors::Error,
    },
    #[error("{path}: primary HDU is not an image")]
    NotAnImage { path: PathBuf },
    #[error("{path}: unsupported image shape {shape:?}")]
    UnsupportedShape { path: PathBuf, shape: Vec<usize> },
    #[error("{path}: missing header keyword {key}")]
    MissingKeyword { path: PathBuf, key: String },
}

/// Header keyword value written alongside an image
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Float(f64),
    Int(i64),
    Text(String),
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

/// Open handle on the primary image HDU of a FITS file
pub struct FitsReader {
    path: PathBuf,
    fptr: FitsFile,
    hdu: FitsHdu,
    shape: Vec<usize>,
}

impl FitsReader {
    /// Open `path` and locate its primary image HDU
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FitsError> {
        let path = path.as_ref().to_path_buf();
        let mut fptr = FitsFile::open(&path).map_err(|source| FitsError::FitsIo {
            path: path.clone(),
            source,
        })?;
        let hdu = fptr.primary_hdu().map_err(|source| FitsError::FitsIo {
            path: path.clone(),
            source,
        })?;

        let shape = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => shape.clone(),
            _ => return Err(FitsError::NotAnImage { path }),
        };

        Ok(Self {
            path,
            fptr,
            hdu,
            shape,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Image shape in C order, i.e. `[NAXISn, ..., NAXIS1]`
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Shape collapsed to `(planes, rows, cols)`
    pub fn cube_shape(&self) -> Result<(usize, usize, usize), FitsError> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((1, *rows, *cols)),
            [planes, rows, cols] => Ok((*planes, *rows, *cols)),
            [outer, planes, rows, cols] if *outer == 1 || *planes == 1 => {
                Ok((outer * planes, *rows, *cols))
            }
            _ => Err(FitsError::UnsupportedShape {
                path: self.path.clone(),
                shape: self.shape.clone(),
            }),
        }
    }

    /// Read the pixel data as `(plane, y, x)`
    pub fn read_cube(&mut self) -> Result<Array3<f64>, FitsError> {
        let shape = self.cube_shape()?;
        let pixels: Vec<f64> =
            self.hdu
                .read_image(&mut self.fptr)
                .map_err(|source| FitsError::FitsIo {
                    path: self.path.clone(),
                    source,
                })?;

        Array3::from_shape_vec(shape, pixels).map_err(|_| FitsError::UnsupportedShape {
            path: self.path.clone(),
            shape: self.shape.clone(),
        })
    }

    /// Read a numeric keyword, `None` when absent or not numeric
    pub fn read_float(&mut self, key: &str) -> Option<f64> {
        self.hdu.read_key::<f64>(&mut self.fptr, key).ok()
    }

    /// Read a numeric keyword that must be present
    pub fn require_float(&mut self, key: &str) -> Result<f64, FitsError> {
        self.read_float(key).ok_or_else(|| FitsError::MissingKeyword {
            path: self.path.clone(),
            key: key.to_string(),
        })
    }

    /// Read a string keyword, `None` when absent
    pub fn read_text(&mut self, key: &str) -> Option<String> {
        self.hdu
            .read_key::<String>(&mut self.fptr, key)
            .ok()
            .map(|value| value.trim().to_string())
    }
}

/// Write `data` as the primary HDU of a new FITS file, replacing any existing file.
///
/// Single-plane data is written as a 2D image when `flatten_single_plane` is set,
/// otherwise as a 3D cube with `NAXIS3` equal to the number of planes.
pub fn write_cube<P: AsRef<Path>>(
    path: P,
    data: &ArrayView3<f64>,
    flatten_single_plane: bool,
    header: &[(String, HeaderValue)],
) -> Result<(), FitsError> {
    let path = path.as_ref().to_path_buf();
    let wrap = |source| FitsError::FitsIo {
        path: path.clone(),
        source,
    };

    let (planes, rows, cols) = data.dim();
    let dimensions: Vec<usize> = if planes == 1 && flatten_single_plane {
        vec![rows, cols]
    } else {
        vec![planes, rows, cols]
    };
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &dimensions,
    };

    let mut fptr = FitsFile::create(&path)
        .with_custom_primary(&description)
        .overwrite()
        .open()
        .map_err(wrap)?;
    let hdu = fptr.primary_hdu().map_err(wrap)?;

    let pixels: Vec<f64> = data.iter().copied().collect();
    hdu.write_image(&mut fptr, &pixels).map_err(wrap)?;

    for (key, value) in header {
        match value {
            HeaderValue::Float(v) => hdu.write_key(&mut fptr, key, *v),
            HeaderValue::Int(v) => hdu.write_key(&mut fptr, key, *v),
            HeaderValue::Text(v) => hdu.write_key(&mut fptr, key, v.as_str()),
        }
        .map_err(wrap)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    #[test]
    fn test_cube_with_header_survives_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cube.fits");

        let data = Array3::from_shape_fn((3, 4, 5), |(c, y, x)| (c * 100 + y * 10 + x) as f64);
        let header = vec![
            ("BMAJ".to_string(), HeaderValue::from(0.0025)),
            ("CTYPE3".to_string(), HeaderValue::from("FREQ")),
            ("NCHAN".to_string(), HeaderValue::from(3_i64)),
        ];
        write_cube(&path, &data.view(), true, &header).unwrap();

        let mut reader = FitsReader::open(&path).unwrap();
        assert_eq!(reader.shape(), &[3, 4, 5]);
        let read = reader.read_cube().unwrap();
        assert_eq!(read, data);
        assert_relative_eq!(reader.read_float("BMAJ").unwrap(), 0.0025);
        assert_eq!(reader.read_text("CTYPE3").as_deref(), Some("FREQ"));
        assert!(reader.read_float("BMIN").is_none());
        let err = reader.require_float("BMIN").unwrap_err();
        assert!(err.to_string().contains("BMIN"));
    }

    #[test]
    fn test_single_plane_written_as_2d() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plane.fits");

        let mut data = Array3::from_elem((1, 2, 3), 1.5);
        data[[0, 1, 2]] = f64::NAN;
        write_cube(&path, &data.view(), true, &[]).unwrap();

        let mut reader = FitsReader::open(&path).unwrap();
        assert_eq!(reader.shape(), &[2, 3]);
        let read = reader.read_cube().unwrap();
        assert_eq!(read.dim(), (1, 2, 3));
        assert!(read[[0, 1, 2]].is_nan());
        assert_relative_eq!(read[[0, 0, 0]], 1.5);
    }

    #[test]
    fn test_missing_file_is_reported_with_path() {
        let err = FitsReader::open("/nonexistent/field.fits").err().unwrap();
        assert!(err.to_string().contains("/nonexistent/field.fits"));
    }
}
