use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use otlist::config::Config;
use otlist::print::render_day;
use otlist::{load_config, HttpBackend, OtListError, ProcedureListStore};

#[derive(Parser)]
#[command(name = "otlist", about = "Operating theatre list client")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a day's list grouped by room
    Print { day: String },
    /// Follow realtime changes to a day's list until Ctrl+C
    Watch { day: String },
    /// Drag `source` onto `target`'s position
    Reorder { day: String, source: String, target: String },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open(config: &Config, day: &str) -> Result<ProcedureListStore<HttpBackend>, OtListError> {
    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    let store = ProcedureListStore::new(backend, config.collections.clone(), day);
    store.load().await?;
    Ok(store)
}

async fn print(config: &Config, day: &str) -> Result<(), OtListError> {
    let store = open(config, day).await?;
    let ot_day = store.fetch_day().await?;
    let rooms = store.rooms(&ot_day).await?;
    let state = store.snapshot().await;

    let mut comments = Vec::new();
    for procedure in &state.procedures {
        comments.extend(store.comments(&procedure.id).await?);
    }
    print!("{}", render_day(&ot_day, &rooms, &state.procedures, &comments));
    Ok(())
}

async fn watch(config: &Config, day: &str) -> Result<(), OtListError> {
    let store = open(config, day).await?;
    let mut subscription = store.subscribe().await?;
    tracing::info!(day, "Watching for changes, press Ctrl+C to stop");

    tokio::select! {
        merged = store.follow(&mut subscription) => {
            tracing::warn!(merged, "Realtime channel closed");
        }
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!("Cannot listen for Ctrl+C: {err}");
            }
            tracing::info!("Ctrl+C received, unsubscribing");
        }
    }

    store.unsubscribe().await?;
    let state = store.snapshot().await;
    tracing::info!(procedures = state.procedures.len(), failed = state.failed.len(), "Stopped watching");
    Ok(())
}

async fn reorder(config: &Config, day: &str, source: &str, target: &str) -> Result<(), OtListError> {
    let store = open(config, day).await?;
    let results = store.reorder(source, target).await;
    if results.is_empty() {
        println!("Nothing to move");
    }
    for (id, status) in results {
        println!("{id}: {status:?}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config);

    match &cli.command {
        Command::Print { day } => print(&config, day).await?,
        Command::Watch { day } => watch(&config, day).await?,
        Command::Reorder { day, source, target } => reorder(&config, day, source, target).await?,
    }
    Ok(())
}
