use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use localshow::{entrypoint, stats::StatsDb, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "localshowd",
    version,
    about = "A simple HTTP(S) reverse proxy over SSH tunnels"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(
        long,
        global = true,
        default_value = "/etc/localshow/localshow.toml",
        value_name = "PATH"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Import failed login attempts from a CSV file.
    Import {
        /// CSV file with a `date,address,username,password` header.
        #[arg(long, short = 'f', value_name = "PATH")]
        csv_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    match cli.command {
        Some(Command::Import { csv_file }) => {
            let Some(database) = config.database.as_ref() else {
                return Err(eyre!("config has no [database] section"));
            };
            let db = StatsDb::connect(database).await?;
            let imported = db.import_from_csv(&csv_file).await?;
            info!(rows = imported, "CSV import finished.");
            Ok(())
        }
        None => entrypoint(config).await,
    }
}
