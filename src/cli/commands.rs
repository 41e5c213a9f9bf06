//! CLI command implementations

use anyhow::Result;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::TracingSink;
use crate::exchange::create_adapter;
use crate::strategy::StrategyEngine;

/// Start the trading loop
pub async fn start(config: &Config, dry_run: bool) -> Result<()> {
    let mut config = config.clone();
    if dry_run {
        config.bot.dry_run = true;
    }
    if config.bot.dry_run {
        warn!("Running in DRY-RUN mode - no real orders will be placed");
    }

    info!("Starting grid trading bot...");
    info!(
        "Exchange: {}, pair: {}/{}, band: {}",
        config.bot.exchange,
        config.bot.order_currency,
        config.bot.payment_currency,
        if config.bot.hf_mode {
            "high_frequency"
        } else {
            "default"
        }
    );

    let adapter = create_adapter(&config)?;
    let mut engine = StrategyEngine::new(&config, adapter, Box::new(TracingSink));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_token.cancel();
        }
    });

    engine.run(shutdown).await?;
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check venue connectivity
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let mut all_healthy = true;
    let mut adapter = create_adapter(config)?;

    print!("{} quote... ", adapter.venue());
    let started = Instant::now();
    match adapter.get_quote().await {
        Ok(quote) => println!(
            "OK ({}ms, price {})",
            started.elapsed().as_millis(),
            quote.price
        ),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    if config.bot.dry_run {
        println!("account balance... SKIPPED (dry-run)");
    } else {
        print!("account balance... ");
        match adapter.get_balance().await {
            Ok(balance) => println!("OK (cash {:.2}, asset {:.6})", balance.cash, balance.asset),
            Err(e) => {
                println!("FAILED: {}", e);
                all_healthy = false;
            }
        }
    }

    println!();
    if all_healthy {
        println!("All checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more health checks failed")
    }
}
