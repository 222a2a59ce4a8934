mod analysis;
mod config;
mod engine;
mod events;
mod exchange;
mod indicators;
mod market;
mod notifications;
mod positions;
mod regime;
mod risk;
mod stats;
mod strategies;
mod types;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use config::Settings;
use engine::{BotController, TradingLoop};
use events::DecisionLog;
use exchange::{ExchangeApi, UpbitClient};
use market::MarketData;
use notifications::NotificationManager;
use positions::PositionBook;
use types::Symbol;

#[derive(Parser)]
#[command(name = "krw-trading-bot")]
#[command(version = "0.1.0")]
#[command(about = "Automated spot-trading bot for Upbit KRW markets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading loop against the live exchange
    Live,
    /// Show current prices for the configured universe
    Prices,
    /// Print the analyzer's view of a symbol
    Analyze {
        /// Market code, e.g. KRW-SOL
        #[arg(short, long)]
        symbol: String,
    },
    /// Show the tracked position snapshot
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::load(&cli.config)?;
    if let Err(errors) = settings.validate() {
        for e in &errors {
            error!("config: {}", e);
        }
        bail!("invalid configuration ({} error(s))", errors.len());
    }

    match cli.command {
        Commands::Live => run_live(settings).await,
        Commands::Prices => show_prices(settings).await,
        Commands::Analyze { symbol } => analyze_symbol(settings, &symbol).await,
        Commands::Status => show_status(settings),
    }
}

async fn run_live(settings: Settings) -> Result<()> {
    if !settings.api.is_complete() {
        bail!("missing API credentials: set api.access_key/secret_key or UPBIT_ACCESS_KEY/UPBIT_SECRET_KEY");
    }

    info!("KRW trading bot starting (live)");
    let exchange: Arc<dyn ExchangeApi> = Arc::new(UpbitClient::new(
        settings.api.access_key.clone(),
        settings.api.secret_key.clone(),
    ));
    let book = Arc::new(PositionBook::new(&settings.storage.position_snapshot_file));
    let decisions = Arc::new(DecisionLog::open(&settings.storage.decision_log_file)?);
    let notifications = Arc::new(NotificationManager::new());
    let controller = Arc::new(BotController::new());

    // Ctrl-C requests a graceful stop; the loop finishes its tick first.
    let stop_controller = Arc::clone(&controller);
    let liquidate_on_stop = settings.trading.liquidate_on_stop;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop_controller.request_stop(liquidate_on_stop);
        }
    });

    let mut trading_loop = TradingLoop::new(
        settings,
        controller,
        exchange,
        book,
        decisions,
        notifications,
    );
    trading_loop.run().await
}

async fn show_prices(settings: Settings) -> Result<()> {
    let exchange = UpbitClient::new(String::new(), String::new());
    for ticker in &settings.coin_selection.fixed_tickers {
        let symbol = match Symbol::parse(ticker) {
            Some(s) => s,
            None => continue,
        };
        match exchange.current_price(&symbol).await {
            Ok(price) => println!("{:<10} {:>16} KRW", symbol, price),
            Err(e) => println!("{:<10} unavailable ({})", symbol, e),
        }
    }
    Ok(())
}

async fn analyze_symbol(settings: Settings, symbol: &str) -> Result<()> {
    let symbol = match Symbol::parse(symbol) {
        Some(s) => s,
        None => bail!("not a KRW market code: {}", symbol),
    };
    let exchange: Arc<dyn ExchangeApi> =
        Arc::new(UpbitClient::new(String::new(), String::new()));
    let market = MarketData::new(exchange);
    let analyzer = analysis::SymbolAnalyzer::new(settings.strategy.clone());

    let series = market
        .resampled(&symbol, settings.strategy.signal_candle_minutes, 240)
        .await;
    let state = series.as_ref().and_then(|s| analyzer.analyze(s));
    match state {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("{}: not enough closed candles to analyze", symbol),
    }
    Ok(())
}

fn show_status(settings: Settings) -> Result<()> {
    let book = PositionBook::new(&settings.storage.position_snapshot_file);
    let count = book.load();
    if count == 0 {
        println!("no tracked positions");
        return Ok(());
    }
    for position in book.all() {
        println!(
            "{:<10} amount {:>16} @ {:>12} ({}) opened {}",
            position.symbol,
            position.amount,
            position.buy_price,
            position.buy_meta.strategy,
            position.timestamp.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}
