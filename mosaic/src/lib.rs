//! Beam-weighted mosaicking of radio pointings
//!
//! Combines overlapping pointings (2D images or spectral cubes, each with a
//! primary beam) into one mosaic. The pipeline optionally convolves every
//! pointing to a common resolution ([`resolution`], [`convolution`]),
//! reprojects onto a shared grid ([`reproject`]) and merges the pointings
//! with beam-squared weights ([`weights`], [`combine`]).
//!
//! [`driver::build_mosaic`] runs the pipeline on pointings held in memory;
//! [`driver::run`] is the file-level pipeline behind the `make_mosaic` binary.

pub mod args;
pub mod combine;
pub mod config;
pub mod convolution;
pub mod driver;
pub mod error;
pub mod io;
pub mod naming;
pub mod pointing;
pub mod psf;
pub mod report;
pub mod reproject;
pub mod resolution;
pub mod weights;

pub use config::{MosaicConfig, ResolutionConfig, RunConfig};
pub use driver::{build_mosaic, run, MosaicProduct, RunSummary};
pub use error::MosaicError;
pub use pointing::{MosaicType, Pointing};
pub use psf::PsfDescriptor;
pub use report::{CollectingReporter, LogReporter, Reporter, RunEvent};
pub use resolution::PsfPolicy;
