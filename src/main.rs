mod config;
mod crawler;
mod errors;
mod harvester;
mod identity;
mod line_reader;
mod prospector;
mod registrar;

use clap::Parser;
use config::Config;
use crawler::{Crawler, CrawlerWiring};
use errors::exit_code;
use std::path::PathBuf;
use std::process::ExitCode;

fn default_config_path() -> PathBuf {
    PathBuf::from("flicker.yaml")
}

/// Tails the configured files and ships framed lines to a spooler.
#[derive(Parser, Debug)]
#[command(name = "flicker", version, about)]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "config", default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Parse configuration, report, and exit without starting the crawler.
    #[arg(long = "test")]
    test: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, path = %cli.config.display(), "failed to load configuration");
            return ExitCode::from(exit_code::CONFIG_ERROR as u8);
        }
    };

    if cli.test {
        println!(
            "Configuration OK: {} prospector(s), registrar snapshot at {}",
            config.prospectors.len(),
            config.registrar.path.display()
        );
        return ExitCode::from(exit_code::SUCCESS as u8);
    }

    let CrawlerWiring {
        crawler,
        mut spooler_rx,
        ack_tx: _ack_tx,
    } = Crawler::start(config);

    // No external spooler is wired up yet; drain the channel so prospectors
    // and harvesters never block on backpressure, and log what passes
    // through. A real deployment replaces this with the actual publisher.
    let drain = tokio::spawn(async move {
        while let Some(event) = spooler_rx.recv().await {
            tracing::trace!(
                path = %event.source_path.display(),
                offset = event.offset_after_line,
                "harvested line"
            );
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => tracing::warn!(error = %e, "failed to listen for shutdown signal"),
    }

    let code = crawler.shutdown().await;
    let _ = drain.await;
    ExitCode::from(code as u8)
}
