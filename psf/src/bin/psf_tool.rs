//! Command-line driver for the PCA PSF determiner.
//!
//! - `synthetic`: render a grid of Gaussian stars, determine its PSF and
//!   print the eigen-spectrum, per-round rejections and quality metrics
//! - `defaults`: print the default configuration as JSON

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use psf::{Candidate, PcaPsfConfig, PcaPsfDeterminer, PsfError, Source};
use shared::image_proc::{grid_positions, render_star_field, FieldNoise, SyntheticStar};
use shared::ImageSize;

/// PCA PSF determination tool
#[derive(Parser, Debug)]
#[command(name = "psf_tool")]
#[command(about = "Determine a spatially varying PSF from star candidates")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Determine the PSF of a synthetic star field
    Synthetic {
        /// Image width in pixels
        #[arg(long, default_value = "110")]
        width: usize,

        /// Image height in pixels
        #[arg(long, default_value = "301")]
        height: usize,

        /// Stars per row of the grid
        #[arg(long, default_value = "3")]
        nx: usize,

        /// Stars per column of the grid
        #[arg(long, default_value = "6")]
        ny: usize,

        /// Gaussian sigma of every star in pixels
        #[arg(long, default_value = "1.75")]
        sigma: f64,

        /// Total flux of every star
        #[arg(long, default_value = "1e5")]
        flux: f64,

        /// Amplitude of the uniform background noise
        #[arg(long, default_value = "0.5")]
        noise: f64,

        /// Random seed for the noise
        #[arg(long, default_value = "42")]
        seed: u64,

        /// JSON configuration file (defaults are used otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration
    Defaults,
}

#[allow(clippy::too_many_arguments)]
fn run_synthetic(
    size: ImageSize,
    nx: usize,
    ny: usize,
    sigma: f64,
    flux: f64,
    noise: f64,
    seed: u64,
    config: Option<PathBuf>,
) -> Result<(), PsfError> {
    let config = match config {
        Some(path) => PcaPsfConfig::load_from_file(&path)?,
        None => PcaPsfConfig::default(),
    };

    let stars: Vec<SyntheticStar> = grid_positions(size, nx, ny, 4.0 * sigma + 5.0)
        .into_iter()
        .map(|(x, y)| SyntheticStar::new(x, y, flux, sigma))
        .collect();
    let image = render_star_field(size, &stars, FieldNoise::Uniform { amplitude: noise }, seed)?;
    info!("Rendered {} stars into a {} image", stars.len(), size);

    let candidates: Vec<Candidate> = stars
        .iter()
        .enumerate()
        .map(|(i, star)| {
            let (m_xx, m_yy, m_xy) = star.moments();
            let source =
                Source::new(i as u64, star.x, star.y, star.flux).with_moments(m_xx, m_yy, m_xy);
            Candidate::new(source)
        })
        .collect();

    let determiner = PcaPsfDeterminer::new(config)?;
    let mut metrics: BTreeMap<String, f64> = BTreeMap::new();
    let result = determiner.determine_psf(&image, candidates, Some(&mut metrics))?;

    println!("Kernel size: {}", result.kernel_size);
    println!("Eigenvalues:");
    for (k, lambda) in result.psf.eigenvalues().iter().enumerate() {
        println!("  {k}: {lambda:.6e}");
    }
    println!("Rounds:");
    for round in &result.rounds {
        println!(
            "  {}: fit {:3}  chi2 {:8.3}  chi2-rejected {:2}/{:2}  spatial-rejected {:2}  bad {:2}",
            round.round + 1,
            round.n_fit,
            round.spatial_chi2,
            round.chi2_rejected,
            round.chi2_pool,
            round.spatial_rejected,
            round.n_bad
        );
    }
    println!("Quality:");
    for (key, value) in &metrics {
        println!("  {key} = {value}");
    }
    for candidate in result.registry.iter(true) {
        if candidate.is_bad() {
            println!(
                "Rejected candidate {} at ({:.1}, {:.1}) chi2 {:.3}",
                candidate.source().id,
                candidate.x(),
                candidate.y(),
                candidate.chi2()
            );
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let outcome = match args.command {
        Command::Synthetic {
            width,
            height,
            nx,
            ny,
            sigma,
            flux,
            noise,
            seed,
            config,
        } => run_synthetic(
            ImageSize::from_width_height(width, height),
            nx,
            ny,
            sigma,
            flux,
            noise,
            seed,
            config,
        ),
        Command::Defaults => {
            PcaPsfConfig::default()
                .to_json_pretty()
                .map(|json| println!("{json}"))
        }
    };

    if let Err(err) = outcome {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
