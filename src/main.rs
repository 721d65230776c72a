//! zonetop: GPU timestamp zone probe.
//!
//! Drives the gpu-zones engine against a simulated device: records nested
//! zones from several threads, harvests the query ring and reports ring and
//! calibration health. Run `zonetop --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod color;
mod config;
mod simulate;
mod workload;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    // Load config (except for `init` which doesn't need it)
    let config = match &cli.command {
        Commands::Init => None,
        _ => {
            let cfg = if cli.config.exists() {
                config::ZonetopConfig::load(&cli.config)?
            } else {
                eprintln!(
                    "No '{}' found — using the built-in example (`zonetop init > {}` to customise).",
                    cli.config.display(),
                    cli.config.display()
                );
                config::ZonetopConfig::default_example()
            };
            cfg.validate()?;
            Some(cfg)
        }
    };

    match (cli.command, config) {
        (Commands::Init, _) => {
            let example = config::ZonetopConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        (Commands::Simulate { frames, output }, Some(cfg)) => {
            simulate::run(&cfg, frames, output)?;
        }
        (Commands::Bench { duration, output }, Some(cfg)) => {
            bench::run(&cfg, duration, output)?;
        }
        (_, None) => unreachable!("config is loaded for every command but init"),
    }

    Ok(())
}
