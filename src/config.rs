use crate::error::{ProtocolError, Result};
use crate::model::PaymentMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub relays: RelayConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub fare: FareConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RelayConfig {
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct NegotiationConfig {
    /// How long the rider collects bids before selecting a winner.
    pub bid_window_secs: u64,
    /// Delay between acceptance (en_route) and the arrived update.
    pub arrived_delay_secs: u64,
    /// Further delay between arrived and completed.
    pub completed_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct FareConfig {
    pub base_fee_sats: u64,
    pub per_mile_sats: u64,
    pub per_minute_sats: u64,
    pub surge_pct: u64,
    pub risk_buffer_sats: u64,
    /// Deposit as a fraction of the total, capped below.
    pub deposit_pct: f64,
    pub deposit_cap_sats: u64,
    /// Placeholder trip estimate until a real estimator is wired in.
    pub estimated_miles: f64,
    pub estimated_minutes: f64,
    pub eta_mins: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct PaymentConfig {
    pub modes: Vec<PaymentMode>,
    pub btc_rpc_url: Option<String>,
    pub btc_rpc_username: Option<String>,
    pub btc_rpc_password: Option<String>,
    pub btc_address_type: Option<String>,
    pub allow_non_mainnet: bool,
    pub min_confirmations: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            urls: vec![
                "wss://relay.damus.io".to_string(),
                "wss://relay.primal.net".to_string(),
                "wss://nos.lol".to_string(),
            ],
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { bid_window_secs: 10, arrived_delay_secs: 30, completed_delay_secs: 60 }
    }
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fee_sats: 1500,
            per_mile_sats: 1200,
            per_minute_sats: 80,
            surge_pct: 10,
            risk_buffer_sats: 500,
            deposit_pct: 0.15,
            deposit_cap_sats: 2000,
            estimated_miles: 4.2,
            estimated_minutes: 13.0,
            eta_mins: 6,
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            modes: vec![PaymentMode::Ln, PaymentMode::Onchain],
            btc_rpc_url: None,
            btc_rpc_username: None,
            btc_rpc_password: None,
            btc_address_type: None,
            allow_non_mainnet: false,
            min_confirmations: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl FareConfig {
    /// Quoted total for a trip estimate, surge applied last.
    pub fn quote_total(&self, miles: f64, minutes: f64) -> u64 {
        let raw = self.base_fee_sats as f64
            + miles * self.per_mile_sats as f64
            + minutes * self.per_minute_sats as f64
            + self.risk_buffer_sats as f64;
        (raw * (1.0 + self.surge_pct as f64 / 100.0)).round() as u64
    }

    pub fn deposit_for(&self, total_sats: u64) -> u64 {
        let deposit = (total_sats as f64 * self.deposit_pct).round() as u64;
        deposit.min(self.deposit_cap_sats)
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| ProtocolError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BTC_RPC_URL") {
            self.payment.btc_rpc_url = Some(url);
        }
        if let Ok(username) = std::env::var("BTC_RPC_USERNAME") {
            self.payment.btc_rpc_username = Some(username);
        }
        if let Ok(password) = std::env::var("BTC_RPC_PASSWORD") {
            self.payment.btc_rpc_password = Some(password);
        }
        if let Ok(window) = std::env::var("BID_WINDOW_SECS") {
            if let Ok(secs) = window.parse() {
                self.negotiation.bid_window_secs = secs;
            }
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.relays.urls.is_empty() {
            return Err(ProtocolError::Config("At least one relay is required".to_string()));
        }
        if self.negotiation.bid_window_secs == 0 {
            return Err(ProtocolError::Config("Bid window cannot be zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.fare.deposit_pct) {
            return Err(ProtocolError::Config("Deposit percentage must be within [0, 1]".to_string()));
        }
        if self.fare.eta_mins == 0 {
            return Err(ProtocolError::Config("ETA cannot be zero".to_string()));
        }
        if self.payment.modes.is_empty() {
            return Err(ProtocolError::Config("At least one payment mode is required".to_string()));
        }
        Ok(())
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| ProtocolError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| ProtocolError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
