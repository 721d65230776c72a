//! CLI definitions for zonetop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "zonetop",
    version,
    about = "GPU zone timing probe\n\nRecord nested timestamp zones on simulated command queues, harvest the query ring and watch calibration and ring health.",
    long_about = None
)]
pub struct Cli {
    /// Path to zonetop.toml config file
    #[clap(long, short, default_value = "zonetop.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a frame-based workload on every configured queue and dump the events
    Simulate {
        /// Number of frames to record (default: workload.frames from the config)
        #[clap(long)]
        frames: Option<u64>,

        /// Write events as JSON lines to this file (default: count only)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Hammer zone creation on one queue and output a structured report
    Bench {
        /// How many seconds to run the benchmark
        #[clap(long, default_value = "10")]
        duration: u64,

        /// Write JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Print an example zonetop.toml to stdout
    Init,
}
