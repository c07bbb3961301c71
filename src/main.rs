//! logiwatch - follows EVE Online combat logs and tracks repair sessions.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use logiwatch_lib::{Error, MonitorSettings};

#[derive(Parser)]
#[command(name = "logiwatch")]
#[command(about = "Tails EVE Online combat logs and tracks logistics repair sessions")]
#[command(version)]
struct Cli {
    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gamelogs directory (defaults to Documents/EVE/logs/Gamelogs)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Character whose logs are followed
    #[arg(long, short)]
    character: Option<String>,

    /// Directory for the JSON event and session store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Don't guess the character from log file names
    #[arg(long)]
    no_detect: bool,
}

impl Cli {
    fn into_settings(self) -> Result<MonitorSettings, Error> {
        let mut settings = match self.config.as_deref() {
            Some(path) => MonitorSettings::load(path)?,
            None => MonitorSettings::default(),
        };

        if let Some(log_dir) = self.log_dir {
            settings.log_directory = log_dir;
        }
        if let Some(character) = self.character {
            settings.character_name = Some(character);
        }
        if let Some(data_dir) = self.data_dir {
            settings.data_directory = Some(data_dir);
        }
        if let Some(interval_ms) = self.interval_ms {
            settings.poll_interval_ms = interval_ms;
        }
        if self.no_detect {
            settings.detect_character = false;
        }

        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("logiwatch=info,logiwatch_lib=info")
        }))
        .init();

    let settings = Cli::parse().into_settings()?;
    logiwatch_lib::run(settings).await
}
