//! Dev harness: one driver and one rider with ephemeral keys, end to end
//! over the in-memory hub.

use anyhow::Result;
use clap::Parser;
use farebid::model::{PaymentMode, RideRequest};
use farebid::payment::{BitcoinRpc, BitcoinRpcConfig, PaymentProvider, StaticProvider};
use farebid::rider::RiderPhase;
use farebid::{
    AppConfig, DriverAgent, DriverEvent, Keypair, LocalHub, RiderAgent, RiderEvent, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harness")]
#[command(about = "Run a full ride negotiation between ephemeral agents")]
struct Args {
    /// Optional TOML config; defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bid collection window, in seconds.
    #[arg(short, long)]
    window_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load_with_env_overrides(path)?,
        None => AppConfig::default(),
    };
    if let Some(window_secs) = args.window_secs {
        config.negotiation.bid_window_secs = window_secs;
    }
    // Keep the demo brisk unless a config says otherwise.
    if args.config.is_none() {
        config.negotiation.bid_window_secs = 2;
        config.negotiation.arrived_delay_secs = 1;
        config.negotiation.completed_delay_secs = 1;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let hub = LocalHub::new();
    let driver_keys = Keypair::generate();
    let rider_keys = Keypair::generate();
    info!(driver = %driver_keys.public_hex(), rider = %rider_keys.public_hex(), "ephemeral identities generated");

    // Driver side. A configured Bitcoin Core node backs the on-chain mode;
    // otherwise the deterministic provider stands in.
    let payment: Arc<dyn PaymentProvider> = match &config.payment.btc_rpc_url {
        Some(url) => Arc::new(BitcoinRpc::new(BitcoinRpcConfig {
            url: url.clone(),
            username: config.payment.btc_rpc_username.clone(),
            password: config.payment.btc_rpc_password.clone(),
            address_type: config.payment.btc_address_type.clone(),
            allow_non_mainnet: config.payment.allow_non_mainnet,
        })),
        None => Arc::new(StaticProvider::new("bc1qharnessonlyaddress")),
    };

    let (driver_tx, mut driver_rx) = mpsc::channel(64);
    let mut driver = DriverAgent::new(driver_keys, hub.clone(), payment, &config, driver_tx.clone());
    forward(hub.subscribe(driver.broadcast_filter()).await?, driver_tx.clone(), DriverEvent::Inbound);
    forward(hub.subscribe(driver.directed_filter()).await?, driver_tx, DriverEvent::Inbound);

    let driver_task = tokio::spawn(async move {
        while let Some(event) = driver_rx.recv().await {
            if let Err(e) = driver.handle_event(event).await {
                if e.is_fatal() {
                    error!(error = %e, "driver aborting");
                    break;
                }
                warn!(error = %e, "driver event failed");
            }
        }
        driver.shutdown();
    });

    // Rider side.
    let (rider_tx, mut rider_rx) = mpsc::channel(64);
    let mut rider = RiderAgent::new(rider_keys, hub.clone(), &config, rider_tx.clone());
    forward(hub.subscribe(rider.inbound_filter()).await?, rider_tx, RiderEvent::Inbound);

    let request = RideRequest::new(
        "dp3w".to_string(),
        "dp3x".to_string(),
        20,
        25000,
        12,
        vec![PaymentMode::Ln, PaymentMode::Onchain],
    );
    let request_id = request.id.clone();
    rider.open_request(request).await?;

    let rider_task = tokio::spawn(async move {
        while let Some(event) = rider_rx.recv().await {
            if let Err(e) = rider.handle_event(event).await {
                if e.is_fatal() {
                    error!(error = %e, "rider aborting");
                    break;
                }
                warn!(error = %e, "rider event failed");
            }
            match rider.negotiation(&request_id).map(|r| r.phase) {
                Some(RiderPhase::Settled) => {
                    info!("rider settled");
                    break;
                }
                Some(RiderPhase::Abandoned) => {
                    warn!("no bids arrived, negotiation abandoned");
                    break;
                }
                _ => {}
            }
        }
        rider.shutdown();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = rider_task => {
            // Give the driver a beat to verify the receipt.
            sleep(Duration::from_millis(200)).await;
        }
    }
    driver_task.abort();
    info!("harness done");
    Ok(())
}

/// Forward a subscription channel into an agent's event channel.
fn forward<E: Send + 'static>(
    mut rx: mpsc::Receiver<farebid::Envelope>,
    tx: mpsc::Sender<E>,
    wrap: fn(farebid::Envelope) -> E,
) {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if tx.send(wrap(envelope)).await.is_err() {
                break;
            }
        }
    });
}
