// CLI definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ambilume")]
#[command(author, version, about = "Screen-to-LED ambient light streamer")]
#[command(propagate_version = true)]
pub struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture the screen and stream it until Ctrl-C
    #[command(visible_alias = "r")]
    Run {
        /// Configuration file (default: ~/.config/ambilume/config.toml)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Stream a moving rainbow instead of the screen
        #[arg(long)]
        test_pattern: bool,
    },

    /// List serial ports
    Ports,

    /// Listen on MQTT and list the devices that announce themselves
    #[command(visible_alias = "discover")]
    Devices {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// How long to listen
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },

    /// Print the effective configuration
    Config {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}
