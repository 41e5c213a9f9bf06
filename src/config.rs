//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotSettings,
    #[serde(default)]
    pub strategy: StrategySettings,
    #[serde(default)]
    pub bithumb: BithumbSettings,
    #[serde(default)]
    pub kis: KisSettings,
}

/// Top-level bot settings
#[derive(Debug, Clone, Deserialize)]
pub struct BotSettings {
    /// Venue identifier: "bithumb" or "kis"
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_order_currency")]
    pub order_currency: String,
    #[serde(default = "default_payment_currency")]
    pub payment_currency: String,
    /// When true no live orders are placed
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Select the high-frequency band instead of the default one
    #[serde(default = "default_true")]
    pub hf_mode: bool,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            order_currency: default_order_currency(),
            payment_currency: default_payment_currency(),
            dry_run: true,
            hf_mode: true,
        }
    }
}

impl BotSettings {
    /// Legacy ticker symbol, e.g. "USDT_KRW"
    pub fn symbol_ticker(&self) -> String {
        format!(
            "{}_{}",
            self.order_currency.to_uppercase(),
            self.payment_currency.to_uppercase()
        )
    }
}

/// The two strategy bands; one is selected at startup and never mutated
#[derive(Debug, Clone, Deserialize)]
pub struct StrategySettings {
    #[serde(default)]
    pub default: StrategyBand,
    #[serde(default = "StrategyBand::high_frequency")]
    pub high_frequency: StrategyBand,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            default: StrategyBand::default(),
            high_frequency: StrategyBand::high_frequency(),
        }
    }
}

/// Immutable parameter set for one grid strategy band
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyBand {
    /// Fractional price offset between successive grid buy levels
    pub buy_step: f64,
    /// Order-value growth factor per grid step
    pub martingale_multiplier: f64,
    pub max_steps: usize,
    /// Value (in payment currency) of the first grid order
    pub base_order_value: f64,
    pub tp_multiplier: f64,
    pub sl_multiplier: f64,
    pub tp_floor: f64,
    pub sl_floor: f64,
    /// EWMA half-life in seconds
    pub vol_halflife: f64,
    pub vol_min: f64,
    pub vol_max: f64,
    pub sleep_seconds: f64,
    pub order_cooldown: f64,
    pub max_orders_per_minute: usize,
    pub cancel_base_wait: f64,
    pub cancel_min_wait: f64,
    pub cancel_max_wait: f64,
    pub cancel_volume_scale: f64,
    pub failure_pause_seconds: f64,
    pub failure_pause_backoff: f64,
    pub failure_pause_max: f64,
    pub post_fill_pause_seconds: f64,
    /// Minutes without a fill (and no open positions) before the base
    /// price is re-anchored to the market
    pub base_reset_minutes: f64,
}

impl Default for StrategyBand {
    fn default() -> Self {
        Self {
            buy_step: 0.008,
            martingale_multiplier: 1.5,
            max_steps: 10,
            base_order_value: 5000.0,
            tp_multiplier: 0.55,
            sl_multiplier: 1.25,
            tp_floor: 0.003,
            sl_floor: 0.007,
            vol_halflife: 60.0,
            vol_min: 0.001,
            vol_max: 0.015,
            sleep_seconds: 2.0,
            order_cooldown: 6.0,
            max_orders_per_minute: 6,
            cancel_base_wait: 10.0,
            cancel_min_wait: 5.0,
            cancel_max_wait: 30.0,
            cancel_volume_scale: 2000.0,
            failure_pause_seconds: 10.0,
            failure_pause_backoff: 2.0,
            failure_pause_max: 180.0,
            post_fill_pause_seconds: 3.0,
            base_reset_minutes: 30.0,
        }
    }
}

impl StrategyBand {
    /// Tighter band used when `hf_mode` is enabled
    pub fn high_frequency() -> Self {
        Self {
            buy_step: 0.005,
            martingale_multiplier: 1.3,
            max_steps: 10,
            base_order_value: 5000.0,
            tp_multiplier: 0.8,
            sl_multiplier: 1.0,
            tp_floor: 0.0015,
            sl_floor: 0.0025,
            vol_halflife: 30.0,
            vol_min: 0.0045,
            vol_max: 0.015,
            sleep_seconds: 1.5,
            order_cooldown: 4.0,
            max_orders_per_minute: 8,
            failure_pause_seconds: 8.0,
            failure_pause_max: 120.0,
            post_fill_pause_seconds: 2.0,
            ..Self::default()
        }
    }
}

/// Bithumb venue credentials and path selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BithumbSettings {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub rest_base_url: String,
    /// Use the newer REST path as primary instead of the legacy one
    pub prefer_rest: bool,
    /// Retry a failed operation once on the alternate path
    pub enable_failover: bool,
    pub rest_symbol_dash: bool,
    pub rest_symbol_upper: bool,
}

impl Default for BithumbSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: "https://api.bithumb.com".to_string(),
            rest_base_url: "https://api.bithumb.com".to_string(),
            prefer_rest: false,
            enable_failover: true,
            rest_symbol_dash: true,
            rest_symbol_upper: true,
        }
    }
}

/// KIS venue credentials and instrument settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KisSettings {
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    /// "paper" or "live"
    pub mode: String,
    pub exchange_code: String,
    pub symbol: String,
    pub order_lot_size: f64,
    pub base_url_paper: String,
    pub base_url_live: String,
}

impl Default for KisSettings {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: String::new(),
            account_no: String::new(),
            mode: "paper".to_string(),
            exchange_code: "NASD".to_string(),
            symbol: "TQQQ".to_string(),
            order_lot_size: 1.0,
            base_url_paper: "https://openapivts.koreainvestment.com:29443".to_string(),
            base_url_live: "https://openapi.koreainvestment.com:9443".to_string(),
        }
    }
}

impl KisSettings {
    pub fn is_live(&self) -> bool {
        self.mode.eq_ignore_ascii_case("live")
    }

    pub fn base_url(&self) -> &str {
        if self.is_live() {
            &self.base_url_live
        } else {
            &self.base_url_paper
        }
    }
}

fn default_exchange() -> String {
    "bithumb".to_string()
}

fn default_order_currency() -> String {
    "USDT".to_string()
}

fn default_payment_currency() -> String {
    "KRW".to_string()
}

fn default_true() -> bool {
    true
}

/// Show at most the first four characters of a credential
fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        "(not set)".to_string()
    } else if secret.len() <= 4 {
        "****".to_string()
    } else {
        let head: String = secret.chars().take(4).collect();
        format!("{head}****")
    }
}

impl Config {
    /// Load configuration from a TOML file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix GRIDBOT_)
            .add_source(
                config::Environment::with_prefix("GRIDBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// The band the engine will run with, selected once at startup
    pub fn active_band(&self) -> &StrategyBand {
        if self.bot.hf_mode {
            &self.strategy.high_frequency
        } else {
            &self.strategy.default
        }
    }

    /// Human-readable settings dump with secrets masked
    pub fn masked_display(&self) -> String {
        let band_name = if self.bot.hf_mode {
            "high_frequency"
        } else {
            "default"
        };
        let band = self.active_band();
        format!(
            "=== GRIDBOT CONFIGURATION ===\n\
             exchange:        {}\n\
             pair:            {}/{}\n\
             dry_run:         {}\n\
             band:            {}\n\
             buy_step:        {}\n\
             martingale:      {}\n\
             max_steps:       {}\n\
             base_value:      {}\n\
             tp floor/mult:   {}/{}\n\
             sl floor/mult:   {}/{}\n\
             bithumb key:     {}\n\
             bithumb path:    {} (failover: {})\n\
             kis key:         {}\n\
             kis mode:        {}",
            self.bot.exchange,
            self.bot.order_currency,
            self.bot.payment_currency,
            self.bot.dry_run,
            band_name,
            band.buy_step,
            band.martingale_multiplier,
            band.max_steps,
            band.base_order_value,
            band.tp_floor,
            band.tp_multiplier,
            band.sl_floor,
            band.sl_multiplier,
            mask_secret(&self.bithumb.api_key),
            if self.bithumb.prefer_rest {
                "rest"
            } else {
                "legacy"
            },
            self.bithumb.enable_failover,
            mask_secret(&self.kis.app_key),
            self.kis.mode,
        )
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        for (name, band) in [
            ("default", &self.strategy.default),
            ("high_frequency", &self.strategy.high_frequency),
        ] {
            if !(band.buy_step > 0.0 && band.buy_step < 1.0) {
                anyhow::bail!("strategy.{name}.buy_step must be in (0, 1)");
            }
            if band.martingale_multiplier < 1.0 {
                anyhow::bail!("strategy.{name}.martingale_multiplier must be >= 1");
            }
            if band.max_steps == 0 {
                anyhow::bail!("strategy.{name}.max_steps must be positive");
            }
            if band.vol_min > band.vol_max {
                anyhow::bail!("strategy.{name}.vol_min must not exceed vol_max");
            }
            if band.tp_floor <= 0.0 || band.sl_floor <= 0.0 {
                anyhow::bail!("strategy.{name}.tp_floor and sl_floor must be positive");
            }
            if band.cancel_min_wait > band.cancel_max_wait {
                anyhow::bail!("strategy.{name}.cancel_min_wait must not exceed cancel_max_wait");
            }
            if band.vol_halflife <= 0.0 {
                anyhow::bail!("strategy.{name}.vol_halflife must be positive");
            }
        }

        match self.bot.exchange.to_lowercase().as_str() {
            "bithumb" | "kis" => {}
            other => anyhow::bail!("unknown exchange '{other}' (expected bithumb or kis)"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config {
            bot: BotSettings::default(),
            strategy: StrategySettings {
                default: StrategyBand::default(),
                high_frequency: StrategyBand::high_frequency(),
            },
            bithumb: BithumbSettings::default(),
            kis: KisSettings::default(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_buy_step_rejected() {
        let mut config = Config {
            bot: BotSettings::default(),
            strategy: StrategySettings::default(),
            bithumb: BithumbSettings::default(),
            kis: KisSettings::default(),
        };
        config.strategy.default.buy_step = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_active_band_selection() {
        let mut config = Config {
            bot: BotSettings::default(),
            strategy: StrategySettings {
                default: StrategyBand::default(),
                high_frequency: StrategyBand::high_frequency(),
            },
            bithumb: BithumbSettings::default(),
            kis: KisSettings::default(),
        };
        config.bot.hf_mode = true;
        assert_eq!(config.active_band().order_cooldown, 4.0);
        config.bot.hf_mode = false;
        assert_eq!(config.active_band().order_cooldown, 6.0);
    }

    #[test]
    fn test_masked_display_hides_secrets() {
        let mut config = Config {
            bot: BotSettings::default(),
            strategy: StrategySettings::default(),
            bithumb: BithumbSettings::default(),
            kis: KisSettings::default(),
        };
        config.bithumb.api_key = "abcd1234secret".to_string();
        let shown = config.masked_display();
        assert!(shown.contains("abcd****"));
        assert!(!shown.contains("abcd1234secret"));
        assert!(shown.contains("(not set)"));
    }

    #[test]
    fn test_symbol_ticker_format() {
        let bot = BotSettings::default();
        assert_eq!(bot.symbol_ticker(), "USDT_KRW");
    }
}
