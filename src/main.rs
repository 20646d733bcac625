use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::BufReader;

use tradebot::config::{ExchangeSettings, Settings, StrategyKind};
use tradebot::control::{Reporter, ShutdownHandle, ShutdownReason, TradingBot};
use tradebot::exchange::{Exchange, PaperExchange};
use tradebot::indicators::resolve_indicators;
use tradebot::strategy::{QuotingStrategy, SignalEngine, Strategy};

/// Exit status after a managed shutdown
const EXIT_MANAGED_SHUTDOWN: i32 = 3;
const EXIT_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "tradebot")]
#[command(about = "Signal-driven trading bot controlled over stdin/stdout")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tradebot.toml")]
    config: PathBuf,

    /// Exchange section to run, e.g. `paper`
    #[arg(short, long)]
    exchange: String,

    /// Override the session duration in seconds
    #[arg(long)]
    session: Option<u64>,
}

// ============================================================================
// Setup
// ============================================================================

/// Logs go to stderr; stdout carries reports
fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradebot=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_exchange(name: &str, settings: &ExchangeSettings) -> anyhow::Result<Arc<PaperExchange>> {
    match settings.wrapper.as_str() {
        "paper" => {
            let paper = &settings.paper;
            let mut exchange = PaperExchange::new(name)
                .with_seed(paper.seed)
                .with_requests_per_second(paper.requests_per_second);

            for symbol in &settings.symbols {
                let price = paper
                    .prices
                    .get(&symbol.to_uppercase())
                    .copied()
                    .with_context(|| format!("no paper price for {}", symbol))?;
                exchange = exchange.with_market(symbol, price);
            }
            for (currency, amount) in &paper.balances {
                exchange = exchange.with_balance(currency, *amount);
            }
            if !paper.positions {
                exchange = exchange.without_positions();
            }
            if !paper.flattening {
                exchange = exchange.without_flattening();
            }

            tracing::info!(base_url = %settings.base_url, "paper exchange ready");
            Ok(Arc::new(exchange))
        }
        other => bail!("unsupported exchange wrapper {:?}", other),
    }
}

fn build_strategy(
    exchange: Arc<dyn Exchange>,
    settings: &ExchangeSettings,
) -> anyhow::Result<Box<dyn Strategy>> {
    let strategy: Box<dyn Strategy> = match settings.strategy {
        StrategyKind::Signal => {
            let indicators = resolve_indicators(&settings.indicators)?;
            let params: HashMap<_, _> = settings
                .params
                .iter()
                .map(|(symbol, params)| (symbol.clone(), *params))
                .collect();
            Box::new(SignalEngine::new(
                exchange,
                indicators,
                params,
                settings.candle_window,
            ))
        }
        StrategyKind::Quoting => Box::new(QuotingStrategy::new(exchange)),
    };
    Ok(strategy)
}

// ============================================================================
// Main
// ============================================================================

async fn run(cli: Cli) -> anyhow::Result<ShutdownReason> {
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let exchange_settings = settings.exchange(&cli.exchange)?;

    let mut runtime = exchange_settings.runtime();
    if let Some(secs) = cli.session {
        runtime.session_duration = Some(std::time::Duration::from_secs(secs));
    }

    tracing::info!("📊 Configuration:");
    tracing::info!("  Exchange: {} ({})", cli.exchange, exchange_settings.wrapper);
    tracing::info!("  Symbols: {}", exchange_settings.symbols.join(", "));
    tracing::info!("  Strategy: {:?}", exchange_settings.strategy);
    tracing::info!("  Cycle: {:?}, command timeout: {:?}", runtime.cycle_interval, runtime.command_timeout);
    if let Some(session) = runtime.session_duration {
        tracing::info!("  Session: {:?}", session);
    }

    let exchange: Arc<dyn Exchange> = build_exchange(&cli.exchange, exchange_settings)?;
    let strategy = build_strategy(exchange.clone(), exchange_settings)?;

    let shutdown = ShutdownHandle::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.trigger(ShutdownReason::Interrupted);
        }
    });

    let mut bot = TradingBot::new(
        exchange,
        strategy,
        Reporter::stdout(&cli.exchange),
        shutdown,
        runtime,
        exchange_settings.symbols.clone(),
    );

    let reason = bot.run(BufReader::new(tokio::io::stdin())).await?;
    Ok(reason)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 tradebot starting");
    let cli = Cli::parse();

    // Pending stdin reads cannot be cancelled, so exit explicitly rather than
    // waiting on runtime shutdown.
    match run(cli).await {
        Ok(reason) => {
            tracing::info!(%reason, "session ended");
            std::process::exit(EXIT_MANAGED_SHUTDOWN);
        }
        Err(e) => {
            tracing::error!("❌ fatal: {:#}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }
}
