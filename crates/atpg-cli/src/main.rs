use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atpg_core::WebhookPayload;
use atpg_storage::{MemoryRecordStore, PgRecordStore, QuerySet, RecordStoreBackend};
use atpg_sync::{backend_from_config, sync_in_transaction, MirrorConfig};
use atpg_web::AppState;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "atpg-cli")]
#[command(about = "Mirror Airtable records into a Postgres table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook receiver.
    Serve {
        /// Keep records in process memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Upsert a single payload read from a JSON file.
    Sync {
        #[arg(long)]
        payload: PathBuf,
    },
    /// Print the statements generated for the configured table and mapping.
    Sql,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = MirrorConfig::from_env();
    let mapping = Arc::new(config.field_mapping()?);

    match cli.command.unwrap_or(Commands::Serve { memory: false }) {
        Commands::Serve { memory } => {
            let backend: Arc<dyn RecordStoreBackend> = if memory {
                tracing::warn!("serving from an in-memory store; records are lost on exit");
                Arc::new(MemoryRecordStore::new(mapping))
            } else {
                backend_from_config(&config, mapping)?
            };
            atpg_web::serve(config.web_port, AppState::new(backend)).await?;
        }
        Commands::Sync { payload } => {
            let raw = std::fs::read_to_string(&payload)
                .with_context(|| format!("reading {}", payload.display()))?;
            let delivery: WebhookPayload = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", payload.display()))?;
            let backend = backend_from_config(&config, mapping)?;
            let action = sync_in_transaction(backend.as_ref(), &delivery).await?;
            println!("{}: {action}", delivery.id);
        }
        Commands::Sql => {
            let table = config
                .table()?
                .context("PG_TABLE_NAME is not set")?;
            let queries = match QuerySet::from_configured(&table, &mapping) {
                Some(queries) => Arc::new(queries),
                None => {
                    // Column types not named in the mapping are read from the table.
                    let url = config
                        .database_url
                        .as_deref()
                        .context("DATABASE_URL is not set")?;
                    let store = PgRecordStore::connect_lazy(url, 1, &table, mapping.clone())?;
                    store.queries().await?
                }
            };
            println!("{};\n{};\n{};", queries.select, queries.insert, queries.update);
        }
    }

    Ok(())
}
