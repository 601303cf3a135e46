//! Stress Monitor CLI
//!
//! Real-time stress classification hub for wearable sensors.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use stress_monitor::{
    config::Config,
    history::HistoryRequest,
    model::{build_model, ClassificationInvoker, ModelConfig, ModelKind},
    protocol::RecordView,
    server::{build_hub, run, ServerConfig},
    store::{JsonlStore, RecordStore, StoreKind},
    DEFAULT_LOG_FILTER, VERSION,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stress-monitor")]
#[command(version = VERSION)]
#[command(about = "Real-time stress classification hub for wearable sensors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket/HTTP server
    Serve {
        /// Interface to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long, short)]
        port: Option<u16>,

        /// Record store (memory or jsonl)
        #[arg(long)]
        store: Option<StoreKind>,

        /// Score samples with a remote model service at this URL
        #[arg(long)]
        model_endpoint: Option<String>,

        /// Log level for this crate and the HTTP layer (overrides RUST_LOG)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Classify a single reading with the configured model
    Classify {
        /// Heart rate (bpm)
        #[arg(long)]
        hr: f64,

        /// Skin temperature (°C)
        #[arg(long)]
        temp: f64,

        /// Electrodermal activity (µS)
        #[arg(long)]
        eda: f64,
    },

    /// Print stored records, newest first
    History {
        /// Number of records (default 100, capped at the configured maximum)
        #[arg(long, short)]
        limit: Option<i64>,

        /// Only records at or after this date/time (ISO-8601)
        #[arg(long)]
        start: Option<String>,

        /// Only records at or before this date/time (ISO-8601)
        #[arg(long)]
        end: Option<String>,
    },

    /// Show configuration
    Config {
        /// Write the current settings to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            store,
            model_endpoint,
            log_level,
        } => {
            init_logging(log_level.as_deref());
            cmd_serve(host, port, store, model_endpoint);
        }
        Commands::Classify { hr, temp, eda } => {
            init_logging(None);
            cmd_classify(hr, temp, eda);
        }
        Commands::History { limit, start, end } => {
            init_logging(None);
            cmd_history(limit, start, end);
        }
        Commands::Config { init } => {
            cmd_config(init);
        }
    }
}

/// Install the `tracing` subscriber. Logs go to stderr so command output stays clean.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(format!("stress_monitor={level},tower_http={level}")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config from {:?}: {e}", Config::config_path());
            std::process::exit(1);
        }
    }
}

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting async runtime: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_serve(
    host: Option<String>,
    port: Option<u16>,
    store: Option<StoreKind>,
    model_endpoint: Option<String>,
) {
    let mut config = load_config();
    if let Some(host) = host {
        config.bind_host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(store) = store {
        config.store = store;
    }
    if let Some(endpoint) = model_endpoint {
        config.model = ModelConfig {
            kind: ModelKind::Remote,
            endpoint: Some(endpoint),
        };
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    if config.store == StoreKind::Jsonl {
        if let Err(e) = config.ensure_directories() {
            eprintln!("Warning: Could not create directories: {e}");
        }
    }

    println!("Stress Monitor v{VERSION}");
    println!("  Store: {:?}", config.store);
    println!("  Alert threshold: {}", config.alert.threshold);
    println!();

    if let Err(e) = runtime().block_on(serve(config)) {
        tracing::error!("Server failed: {e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let hub = build_hub(&config)?;
    let (addr, shutdown_tx) = run(ServerConfig::from(&config), Arc::clone(&hub)).await?;

    println!("WebSocket: ws://{addr}/ws?role=producer|observer");
    println!("HTTP ingest: http://{addr}/ingest");
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Stopping server");
    let _ = shutdown_tx.send(());
    // Let in-flight responses drain before the runtime is dropped.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let counts = hub.client_counts().await;
    println!();
    println!("Server stopped ({} clients were connected).", counts.total);
    Ok(())
}

fn cmd_classify(hr: f64, temp: f64, eda: f64) {
    let config = load_config();
    let model = match build_model(&config.model) {
        Ok(model) => model,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let invoker = ClassificationInvoker::new(model, config.classify_timeout);
    let prediction = runtime().block_on(invoker.classify(hr, temp, eda));

    println!(
        "{}",
        serde_json::to_string_pretty(&prediction).unwrap_or_else(|_| "Error".to_string())
    );
}

fn cmd_history(limit: Option<i64>, start: Option<String>, end: Option<String>) {
    let config = load_config();
    let path = config.records_path();

    if !path.exists() {
        println!("No records found at {path:?}");
        println!("Run 'stress-monitor serve' to begin collecting data.");
        return;
    }

    let store = match JsonlStore::open(path.clone()) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening {path:?}: {e}");
            std::process::exit(1);
        }
    };

    let params = config.history.resolve(&HistoryRequest {
        limit,
        start_date: start,
        end_date: end,
    });

    match store.query(&params.to_query()) {
        Ok(records) => {
            let views: Vec<RecordView> = records.iter().map(RecordView::from).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&views).unwrap_or_else(|_| "Error".to_string())
            );
            eprintln!("{} record(s), limit {}", views.len(), params.limit);
        }
        Err(e) => {
            eprintln!("Error reading records: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_config(init: bool) {
    let config = Config::load().unwrap_or_default();

    if init {
        if let Err(e) = config.save() {
            eprintln!("Error writing {:?}: {e}", Config::config_path());
            std::process::exit(1);
        }
        println!("Wrote {:?}", Config::config_path());
        println!();
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!("Records file: {:?}", config.records_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}
