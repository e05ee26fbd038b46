//! Event Engine demo
//!
//! Runs the event bus against simulated market data and order feeds.

use clap::{Parser, Subcommand};
use event_engine::config::{Config, LogConfig};
use event_engine::events::{Event, EventEngine, EventType, FnListener};
use event_engine::EngineError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "event-engine")]
#[command(about = "In-process event bus for trading components")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to config.toml / event-engine.toml if present)
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against simulated producers
    Run {
        /// How long to run before stopping
        #[arg(short, long, default_value = "10")]
        duration_secs: u64,
        /// Number of concurrent market data producers
        #[arg(short, long, default_value = "4")]
        producers: usize,
        /// Milliseconds between events from one producer
        #[arg(short, long, default_value = "20")]
        interval_ms: u64,
    },
    /// Print the effective configuration
    Config,
}

const SYMBOLS: [&str; 4] = ["BTC-USD", "ETH-USD", "SOL-USD", "ARB-USD"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, fallback) = match &cli.config {
        Some(path) => (Config::load(path)?, None),
        None => match Config::load_default() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    init_logging(&config.log);
    if let Some(e) = fallback {
        tracing::debug!("Using default configuration: {}", e);
    }

    match cli.command {
        Commands::Run {
            duration_secs,
            producers,
            interval_ms,
        } => run_demo(config, duration_secs, producers, interval_ms).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log.filter));
    let registry = tracing_subscriber::registry().with(filter);

    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_demo(
    config: Config,
    duration_secs: u64,
    producers: usize,
    interval_ms: u64,
) -> anyhow::Result<()> {
    tracing::info!(producers, duration_secs, "Starting event engine demo");

    let engine = Arc::new(EventEngine::new(config.engine.clone()));

    // Per-type tally across every event
    let counts: Arc<Mutex<HashMap<EventType, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    {
        let counts = Arc::clone(&counts);
        engine.register(FnListener::shared("counter", EventType::ALL, move |event| {
            *counts.lock().entry(event.event_type()).or_insert(0) += 1;
            Ok(())
        }));
    }

    // Turns filled orders into trades, submitting back into the bus
    {
        let handle = engine.handle();
        engine.register(FnListener::shared("fill_simulator", [EventType::OrderUpdate], move |event| {
            if event.get("status") != Some(&json!("FILLED")) {
                return Ok(());
            }
            let order_id = event
                .get("order_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("order update without order_id"))?;
            let trade = Event::from_json(
                EventType::TradeUpdate,
                json!({
                    "order_id": order_id,
                    "symbol": event.get("symbol"),
                    "price": event.get("price"),
                }),
            )?;
            handle.try_submit(trade)?;
            Ok(())
        }));
    }

    engine.register(FnListener::shared(
        "trade_logger",
        [EventType::TradeUpdate, EventType::Error, EventType::System],
        |event| {
            tracing::info!(event_type = %event.event_type(), "{}", event);
            Ok(())
        },
    ));

    engine.start()?;

    let tasks: Vec<_> = (0..producers)
        .map(|id| {
            let engine = Arc::clone(&engine);
            tokio::spawn(produce(engine, id, Duration::from_millis(interval_ms.max(1))))
        })
        .collect();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
        _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {}
    }

    for task in &tasks {
        task.abort();
    }
    engine.stop();

    let leftover = engine.process_pending()?;
    if leftover > 0 {
        tracing::info!(leftover, "Drained events left in the queue");
    }

    let mut tally: Vec<_> = counts.lock().iter().map(|(t, n)| (*t, *n)).collect();
    tally.sort();
    for (event_type, n) in tally {
        println!("{:<16} {:>8}", event_type, n);
    }
    println!("{}", serde_json::to_string_pretty(&engine.metrics())?);
    Ok(())
}

/// Random-walk quotes for one symbol, with an order every few ticks
async fn produce(engine: Arc<EventEngine>, id: usize, interval: Duration) {
    let symbol = SYMBOLS[id % SYMBOLS.len()];
    let source = format!("feed-{id}");
    let mut rng = StdRng::from_os_rng();
    let mut price = Decimal::new(rng.random_range(1_000..100_000), 0);
    let mut ticker = tokio::time::interval(interval);

    for tick in 0u64.. {
        ticker.tick().await;

        price += Decimal::new(rng.random_range(-500..=500), 2);
        price = price.max(Decimal::ONE);
        let quote = Event::with_source(
            EventType::MarketData,
            [
                ("symbol".to_string(), json!(symbol)),
                ("price".to_string(), json!(price)),
                ("tick".to_string(), json!(tick)),
            ]
            .into_iter()
            .collect(),
            source.as_str(),
        );
        if !submit(&engine, quote) {
            continue;
        }

        if tick % 5 == 4 {
            let status = if rng.random_bool(0.7) { "FILLED" } else { "CANCELLED" };
            let order = Event::with_source(
                EventType::OrderUpdate,
                [
                    ("order_id".to_string(), json!(format!("{id}-{tick}"))),
                    ("symbol".to_string(), json!(symbol)),
                    ("price".to_string(), json!(price)),
                    ("status".to_string(), json!(status)),
                ]
                .into_iter()
                .collect(),
                source.as_str(),
            );
            submit(&engine, order);
        }
    }
}

/// Submit without blocking the runtime; a full queue drops the event
fn submit(engine: &EventEngine, event: Event) -> bool {
    match engine.try_submit(event) {
        Ok(()) => true,
        Err(EngineError::QueueFull { capacity }) => {
            tracing::warn!(capacity, "Queue full, dropping event");
            false
        }
        Err(e) => {
            tracing::error!("Submit failed: {}", e);
            false
        }
    }
}
