//! ambilume CLI
//!
//! Streams the screen edges to an ambient light controller.

use clap::Parser;
use tracing_subscriber::filter::{Directive, LevelFilter};

mod cli;
use cli::{Cli, Commands};

mod commands;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let ours: Directive = format!("ambilume={level}").parse()?;
    let transport: Directive = format!("ambilume_transport={level}").parse()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(ours)
                .add_directive(transport),
        )
        .init();

    match cli.command {
        Commands::Run {
            config,
            test_pattern,
        } => commands::run(config.as_deref(), test_pattern),
        Commands::Ports => commands::ports(),
        Commands::Devices { config, seconds } => commands::devices(config.as_deref(), seconds),
        Commands::Config { config } => commands::show_config(config.as_deref()),
    }
}
