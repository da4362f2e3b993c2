//! Mosaic a set of pointings from the command line
//!
//! Reads each `*image.fits` target with its `*pb.fits` primary beam,
//! optionally convolves them to a common resolution and regrids them with
//! Montage, then writes the beam-weighted mosaic, its weight map and a JSON
//! run summary into the output directory. Uniform resolution without Montage
//! only writes the convolved pointings for regridding elsewhere.

use clap::Parser;
use env_logger::Env;
use mosaic::args::MosaicArgs;
use mosaic::reproject::{MontageReprojector, Reprojector, SharedGridReprojector};
use mosaic::{run, LogReporter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = MosaicArgs::parse().into_config()?;
    log::info!(
        "Mosaicking {} pointings into {}",
        config.targets.len(),
        config.mosaic_path().display()
    );

    let reprojector: Box<dyn Reprojector> = if config.regrid {
        Box::new(
            MontageReprojector::new(config.work_dir(), config.header_path())
                .with_bin_dir(config.montage_bin.clone()),
        )
    } else {
        Box::new(SharedGridReprojector)
    };

    let summary = run(&config, reprojector.as_ref(), &LogReporter)?;
    match summary.coverage {
        Some(coverage) => log::info!(
            "Done: {} channel(s), {:.1}% coverage",
            summary.channels,
            100.0 * coverage
        ),
        None => log::info!(
            "Done: {} convolved pointing(s) written, combination left for a later run",
            summary.pointings.len()
        ),
    }
    Ok(())
}
