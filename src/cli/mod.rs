pub mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "probekit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect eBPF probe bundles and decode their records", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Show the decode plan compiled for a bundle")]
    Plan {
        #[arg(short, long, help = "Bundle directory")]
        bundle: PathBuf,

        #[arg(long, help = "Type catalog (JSON) whose enums stand in for kernel types")]
        kernel_types: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    #[command(about = "Decode captured records of a bundle")]
    Decode {
        #[arg(short, long, help = "Bundle directory")]
        bundle: PathBuf,

        #[arg(short, long, help = "File of back-to-back raw records")]
        input: PathBuf,

        #[arg(long, help = "Type catalog (JSON) whose enums stand in for kernel types")]
        kernel_types: Option<PathBuf>,

        #[arg(long, help = "Boot time of the capturing host, seconds since the epoch")]
        boot_time: Option<u64>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}
