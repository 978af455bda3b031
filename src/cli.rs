use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Drive a differential robot through an HM-10 bluetooth serial bridge.", long_about = None)]
pub struct Args {
    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Scan for peripherals and list them
    Scan {
        /// Scan for this many seconds instead of the configured window
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Open the drive console (the default)
    Drive {
        /// Connect to this device right away instead of scanning
        #[arg(long)]
        device: Option<String>,

        /// Override the configured max speed
        #[arg(long)]
        max_speed: Option<i32>,
    },
    /// Print the effective configuration
    Config {
        /// Write the default configuration to the config file first
        #[arg(long)]
        reset: bool,
    },
}

impl Default for Command {
    fn default() -> Self {
        Command::Drive { device: None, max_speed: None }
    }
}
