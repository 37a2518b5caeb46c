//! # Chatter Search CLI (`chatter`)
//!
//! Modes:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatter ingestion` | Run the scheduled ingestion worker only |
//! | `chatter serve` | Run the request server plus the ingestion worker |
//! | `chatter search-once "<query>"` | One-shot diagnostic search |
//!
//! All configuration comes from the environment; see the README for the
//! recognized variables. Exit codes: `0` success, `1` configuration
//! error, `2` fatal runtime error.

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chatter_search::config::Config;
use chatter_search::search::SearchOverrides;
use chatter_search::service::Service;

#[derive(Parser)]
#[command(
    name = "chatter",
    about = "Semantic search over chat workspace history",
    version,
    long_about = "Continuously ingests chat messages, embeds them into a vector index, \
    and serves semantic search over the result through an authenticated JSON-RPC endpoint."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion worker: an initial run, then scheduled refreshes.
    Ingestion,

    /// Run the JSON-RPC request server alongside the ingestion worker.
    Serve,

    /// Run a single search and print the results. Diagnostic tool; skips
    /// query enhancement with `--raw`.
    SearchOnce {
        /// The search query.
        query: String,

        /// Number of results to return (1-50).
        #[arg(long)]
        top_k: Option<usize>,

        /// Skip LLM query enhancement.
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatter_search=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let serving = matches!(cli.command, Commands::Serve);
    if let Err(e) = config.validate(serving) {
        error!(error = %e, "Configuration invalid");
        std::process::exit(1);
    }

    let service = match Service::init(config).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Service initialization failed");
            std::process::exit(if e.is_fatal() { 1 } else { 2 });
        }
    };

    let result = match cli.command {
        Commands::Ingestion => run_ingestion(service).await,
        Commands::Serve => run_serve(service).await,
        Commands::SearchOnce { query, top_k, raw } => run_search_once(service, query, top_k, raw).await,
    };

    if let Err(e) = result {
        error!(error = %e, "Fatal runtime error");
        std::process::exit(2);
    }
}

async fn run_ingestion(service: Service) -> anyhow::Result<()> {
    info!(
        channels = service.config.chat_channels.len(),
        interval_hours = service.config.refresh_interval_hours,
        "Starting ingestion worker"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = service.ingestion_worker(shutdown_rx);
    let handle = tokio::spawn(worker.run_forever());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    let _ = shutdown_tx.send(true);

    // The worker finishes its in-flight batch and checkpoints.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), handle).await;
    Ok(())
}

async fn run_serve(service: Service) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = service.ingestion_worker(shutdown_rx.clone());
    let worker_handle = tokio::spawn(worker.run_forever());

    let state = service.app_state();
    let mut server_handle = tokio::spawn(chatter_search::server::run_server(state, shutdown_rx));

    tokio::select! {
        result = &mut server_handle => {
            let _ = shutdown_tx.send(true);
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            let _ = shutdown_tx.send(true);
            // Drain in-flight request handlers for up to ten seconds.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(10), &mut server_handle)
                .await;
        }
    }

    // The worker finishes its current upsert batch and checkpoints.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), worker_handle).await;
    Ok(())
}

async fn run_search_once(
    service: Service,
    query: String,
    top_k: Option<usize>,
    raw: bool,
) -> anyhow::Result<()> {
    let overrides = SearchOverrides {
        skip_enhancement: raw,
        top_k,
        ..Default::default()
    };
    let response = service.search.search(&query, &overrides).await?;

    if let Some(ref enhanced) = response.enhanced_query {
        if enhanced.enhanced_text != response.query {
            println!("enhanced: {}", enhanced.enhanced_text);
        }
    }
    if response.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] #{} / {} ({})",
            i + 1,
            hit.score,
            hit.channel_name,
            hit.user_name,
            hit.ts_iso
        );
        println!("   {}", hit.text_excerpt.replace('\n', " "));
        if let Some(ref link) = hit.permalink {
            println!("   {}", link);
        }
        println!();
    }
    println!("{} result(s)", response.total);
    Ok(())
}
