use anyhow::Result;
use clap::{Parser, Subcommand};
use edge_core::db::DbConfig;
use edge_core::kv_postgres::PgKvStore;

const CLI_NAME: &str = "edge-cli";

#[derive(Parser)]
#[command(name = "edge", version, about = "Blog edge backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the reaction tally API
    ReactionsApi,
    /// Serve the contributions caching proxy
    ActivityProxy,
    /// Apply database migrations
    Migrate,
    Kv {
        #[command(subcommand)]
        command: KvCommand,
    },
}

#[derive(Subcommand)]
enum KvCommand {
    /// Delete expired keys once and exit
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ReactionsApi => {
            let config = edge_reactions::load_config()?;
            edge_reactions::run(config).await?;
        }
        Commands::ActivityProxy => {
            let config = edge_activity::load_config()?;
            edge_activity::run(config).await?;
        }
        Commands::Migrate => {
            edge_core::logging::init(CLI_NAME);
            let database = DbConfig::required_from_env()?;
            let pool = edge_core::db::connect(&database).await?;
            edge_core::migrations::run(&pool).await?;
        }
        Commands::Kv { command } => match command {
            KvCommand::Purge => {
                edge_core::logging::init(CLI_NAME);
                let database = DbConfig::required_from_env()?;
                let pool = edge_core::db::connect(&database).await?;
                let removed = PgKvStore::new(pool).purge_expired().await?;
                tracing::info!(removed, "expired kv entries purged");
            }
        },
    }

    Ok(())
}
