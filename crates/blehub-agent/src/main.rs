use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use blehub_agent::{Forwarder, ForwarderConfig};
use blehub_ble::{AddressType, DeviceSelector, Endpoint, EndpointConfig};

#[derive(Parser)]
#[command(name = "blehub-agent", about = "BLE forwarder agent for the blehub coordinator")]
struct Cli {
    /// Coordinator agent-channel URL, e.g. ws://host:9741/
    #[arg(long)]
    server_url: String,

    /// Shared-secret bearer token; leave empty when the coordinator runs
    /// with authentication disabled
    #[arg(long, default_value = "")]
    token: String,

    /// Stable node identifier; the coordinator generates one when omitted
    #[arg(long)]
    node_id: Option<String>,

    /// Target device address, on platforms that expose one
    #[arg(long)]
    device_address: Option<String>,

    /// BLE address type (public|random); ignored without --device-address
    #[arg(long, default_value = "public")]
    address_type: AddressType,

    /// Case-insensitive substring identifying the device by name; repeatable
    #[arg(long = "name-pattern")]
    name_patterns: Vec<String>,

    /// HCI interface index
    #[arg(long, default_value_t = 0)]
    adapter_index: usize,

    /// Timed scan window in milliseconds
    #[arg(long, default_value_t = 10_000)]
    scan_duration_ms: u64,

    /// Delay between BLE reconnect attempts in milliseconds
    #[arg(long, default_value_t = 5_000)]
    reconnect_delay_ms: u64,

    /// Battery query interval in milliseconds
    #[arg(long, default_value_t = 1_800_000)]
    battery_check_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(
        server_url = %cli.server_url,
        node_id = ?cli.node_id,
        "starting blehub agent"
    );

    let cancel = CancellationToken::new();

    let endpoint_config = EndpointConfig {
        selector: DeviceSelector {
            address: cli.device_address,
            address_type: cli.address_type,
            name_patterns: cli.name_patterns,
        },
        adapter_index: cli.adapter_index,
        scan_duration: Duration::from_millis(cli.scan_duration_ms),
        reconnect_delay: Duration::from_millis(cli.reconnect_delay_ms),
        battery_check_interval: Duration::from_millis(cli.battery_check_interval_ms),
        ..EndpointConfig::default()
    };

    // The endpoint stays down until the coordinator sends `connect`.
    let (endpoint, endpoint_handle) = Endpoint::new(endpoint_config, cancel.clone());
    let ble_task = tokio::spawn(async move {
        if let Err(e) = endpoint.run().await {
            tracing::error!(error = %e, "ble endpoint exited");
        }
    });

    let forwarder = Forwarder::new(
        ForwarderConfig::new(cli.server_url, cli.token, cli.node_id),
        endpoint_handle,
        cancel.clone(),
    );
    let forwarder_task = tokio::spawn(forwarder.run());

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("received ctrl-c, shutting down");
    cancel.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        let _ = tokio::join!(ble_task, forwarder_task);
    })
    .await;

    Ok(())
}
