//! Payment collaborator: instruction generation and on-chain execution.
//!
//! The protocol core only ever asks for a payment instruction keyed on
//! (amount, request, bid). Everything else here - address validation,
//! sending, confirmation polling - is operator tooling around the Bitcoin
//! Core JSON-RPC interface.

use crate::error::{ProtocolError, Result};
use crate::model::PaymentMode;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tokio::time::{sleep, Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct PaymentInstruction {
    pub mode: PaymentMode,
    pub invoice: Option<String>,
    pub address: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Produce the instruction a counterpart should pay against, keyed on
    /// the committed amount and negotiation ids.
    async fn generate_instruction(
        &self,
        amount_sats: u64,
        request_id: &str,
        bid_id: &str,
        mode: PaymentMode,
    ) -> Result<PaymentInstruction>;
}

/// Deterministic provider for tests and the dev harness. The LN invoice is
/// derived from the negotiation ids so repeated requests for the same bid
/// return the same instruction.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    pub onchain_address: String,
}

impl StaticProvider {
    pub fn new(onchain_address: impl Into<String>) -> Self {
        Self { onchain_address: onchain_address.into() }
    }
}

#[async_trait]
impl PaymentProvider for StaticProvider {
    async fn generate_instruction(
        &self,
        amount_sats: u64,
        request_id: &str,
        bid_id: &str,
        mode: PaymentMode,
    ) -> Result<PaymentInstruction> {
        match mode {
            PaymentMode::Ln => Ok(PaymentInstruction {
                mode,
                invoice: Some(format!("lnbc{}n1_{}_{}", amount_sats, request_id, bid_id)),
                address: None,
            }),
            PaymentMode::Onchain => {
                if self.onchain_address.is_empty() {
                    return Err(ProtocolError::Payment("no on-chain address configured".to_string()));
                }
                Ok(PaymentInstruction {
                    mode,
                    invoice: None,
                    address: Some(self.onchain_address.clone()),
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    chain: String,
}

#[derive(Debug, Deserialize)]
struct ValidateAddressResult {
    isvalid: bool,
}

#[derive(Debug, Deserialize)]
struct TransactionInfo {
    #[serde(default)]
    confirmations: u64,
}

#[derive(Debug, Clone)]
pub struct BitcoinRpcConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Address type passed to `getnewaddress`, e.g. "bech32".
    pub address_type: Option<String>,
    /// The node must be on mainnet unless this is set.
    pub allow_non_mainnet: bool,
}

/// Bitcoin Core JSON-RPC client backing the on-chain payment mode.
pub struct BitcoinRpc {
    config: BitcoinRpcConfig,
    client: reqwest::Client,
    mainnet_checked: OnceCell<()>,
}

impl BitcoinRpc {
    pub fn new(config: BitcoinRpcConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            mainnet_checked: OnceCell::new(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let mut request = self.client.post(&self.config.url).json(&json!({
            "jsonrpc": "1.0",
            "id": "farebid",
            "method": method,
            "params": params,
        }));
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProtocolError::Payment(format!(
                "Bitcoin RPC error: {}",
                response.status()
            )));
        }

        let body: RpcResponse<T> = response.json().await?;
        if let Some(error) = body.error {
            return Err(ProtocolError::Payment(format!("Bitcoin RPC error: {}", error.message)));
        }
        body.result
            .ok_or_else(|| ProtocolError::Payment("Bitcoin RPC returned no result".to_string()))
    }

    async fn require_mainnet(&self) -> Result<()> {
        self.mainnet_checked
            .get_or_try_init(|| async {
                let info: BlockchainInfo = self.call("getblockchaininfo", json!([])).await?;
                if info.chain != "main" && !self.config.allow_non_mainnet {
                    return Err(ProtocolError::Payment(format!(
                        "Bitcoin RPC is not on mainnet (chain={})",
                        info.chain
                    )));
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    pub async fn new_address(&self) -> Result<String> {
        self.require_mainnet().await?;
        let params = match &self.config.address_type {
            Some(address_type) => json!(["", address_type]),
            None => json!([]),
        };
        self.call("getnewaddress", params).await
    }

    pub async fn validate_address(&self, address: &str) -> Result<()> {
        self.require_mainnet().await?;
        let result: ValidateAddressResult = self.call("validateaddress", json!([address])).await?;
        if !result.isvalid {
            return Err(ProtocolError::Payment(format!("Invalid on-chain address: {}", address)));
        }
        Ok(())
    }

    pub async fn send_payment(&self, address: &str, amount_sats: u64) -> Result<String> {
        self.require_mainnet().await?;
        self.validate_address(address).await?;
        let txid: String = self
            .call("sendtoaddress", json!([address, sats_to_btc(amount_sats)]))
            .await?;
        info!(txid = %txid, amount_sats, "on-chain payment submitted");
        Ok(txid)
    }

    /// Poll until the transaction reaches `min_confirmations` or the
    /// timeout elapses. Returns the observed confirmation count.
    pub async fn wait_for_confirmations(
        &self,
        txid: &str,
        min_confirmations: u64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<u64> {
        self.require_mainnet().await?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let info: TransactionInfo = self.call("gettransaction", json!([txid])).await?;
            if info.confirmations >= min_confirmations {
                return Ok(info.confirmations);
            }
            sleep(poll_interval).await;
        }
        Err(ProtocolError::Payment(format!(
            "Timed out waiting for {} confirmations for tx {}",
            min_confirmations, txid
        )))
    }
}

#[async_trait]
impl PaymentProvider for BitcoinRpc {
    async fn generate_instruction(
        &self,
        _amount_sats: u64,
        _request_id: &str,
        _bid_id: &str,
        mode: PaymentMode,
    ) -> Result<PaymentInstruction> {
        match mode {
            PaymentMode::Onchain => {
                let address = self.new_address().await?;
                Ok(PaymentInstruction { mode, invoice: None, address: Some(address) })
            }
            PaymentMode::Ln => {
                Err(ProtocolError::Payment("no Lightning backend configured".to_string()))
            }
        }
    }
}

fn sats_to_btc(amount_sats: u64) -> f64 {
    amount_sats as f64 / 100_000_000.0
}
