use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use blehub_ble::{AddressType, DeviceSelector, Endpoint, EndpointConfig, EndpointState};
use blehub_coordinator::pool::{NodePool, PoolConfig};
use blehub_coordinator::server::AgentServer;

#[derive(Parser)]
#[command(name = "blehubd", about = "BLE device coordinator: local radio plus forwarder agents")]
struct Cli {
    /// Agent channel bind address
    #[arg(long, default_value = "0.0.0.0:9741")]
    listen: SocketAddr,

    /// Shared-secret bearer token; "" or "none" disables authentication
    #[arg(long, default_value = "")]
    token: String,

    /// Target device address, on platforms that expose one
    #[arg(long)]
    device_address: Option<String>,

    /// BLE address type (public|random); ignored without --device-address
    #[arg(long, default_value = "public")]
    address_type: AddressType,

    /// Case-insensitive substring identifying the device by name; repeatable
    #[arg(long = "name-pattern")]
    name_patterns: Vec<String>,

    /// HCI interface index for the local radio
    #[arg(long, default_value_t = 0)]
    adapter_index: usize,

    /// Timed scan window in milliseconds
    #[arg(long, default_value_t = 10_000)]
    scan_duration_ms: u64,

    /// Delay between local BLE reconnect attempts in milliseconds
    #[arg(long, default_value_t = 5_000)]
    reconnect_delay_ms: u64,

    /// Battery query interval in milliseconds
    #[arg(long, default_value_t = 1_800_000)]
    battery_check_interval_ms: u64,

    /// Node liveness ping interval in milliseconds
    #[arg(long, default_value_t = 30_000)]
    ping_interval_ms: u64,

    /// Absolute node staleness bound in milliseconds
    #[arg(long, default_value_t = 60_000)]
    stale_timeout_ms: u64,

    /// Extra patience before a failed handoff retries, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    handoff_timeout_ms: u64,

    /// Run a handoff as soon as an agent registers while no writer exists
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    scan_on_start: bool,
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
    tracing::info!(listen = %cli.listen, "starting blehub coordinator");

    let cancel = CancellationToken::new();

    // ---------------------------------------------------------------
    // 1. Local BLE endpoint
    // ---------------------------------------------------------------
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
    let (endpoint, endpoint_handle) = Endpoint::new(endpoint_config, cancel.clone());
    let ble_task = tokio::spawn(async move {
        if let Err(e) = endpoint.run().await {
            // A missing local radio shifts all routing to the agent pool;
            // the coordinator keeps running.
            tracing::error!(error = %e, "local ble endpoint exited");
        }
    });
    // The local endpoint connects at startup and auto-reconnects until
    // shutdown.
    endpoint_handle.connect().await;

    // ---------------------------------------------------------------
    // 2. Node pool
    // ---------------------------------------------------------------
    let pool_config = PoolConfig {
        ping_interval: Duration::from_millis(cli.ping_interval_ms),
        stale_timeout: Duration::from_millis(cli.stale_timeout_ms),
        scan_duration: Duration::from_millis(cli.scan_duration_ms),
        handoff_timeout: Duration::from_millis(cli.handoff_timeout_ms),
        scan_on_start: cli.scan_on_start,
        ..PoolConfig::default()
    };
    let (pool, pool_handle) = NodePool::new(pool_config, cancel.clone());
    let pool_task = tokio::spawn(pool.run());

    // ---------------------------------------------------------------
    // 3. Relay local endpoint readiness into the pool
    // ---------------------------------------------------------------
    let mut state_rx = endpoint_handle.watch_state();
    let relay_pool = pool_handle.clone();
    let relay_cancel = cancel.clone();
    let relay_task = tokio::spawn(async move {
        let mut was_ready = false;
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let ready = *state_rx.borrow() == EndpointState::Ready;
                    if ready != was_ready {
                        was_ready = ready;
                        relay_pool.local_endpoint(ready).await;
                    }
                }
                _ = relay_cancel.cancelled() => break,
            }
        }
    });

    // ---------------------------------------------------------------
    // 4. Agent channel server
    // ---------------------------------------------------------------
    let server = AgentServer::bind(cli.listen, cli.token, pool_handle.clone(), cancel.clone())
        .await?;
    let server_task = tokio::spawn(server.run());

    // ---------------------------------------------------------------
    // 5. Pool notification log
    // ---------------------------------------------------------------
    let mut notifications = pool_handle.subscribe();
    let log_cancel = cancel.clone();
    let log_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    match notification {
                        Ok(n) => tracing::info!(event = ?n, "pool event"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "pool event log lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = log_cancel.cancelled() => break,
            }
        }
    });

    // ---------------------------------------------------------------
    // 6. Wait for ctrl-c, then graceful shutdown
    // ---------------------------------------------------------------
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("received ctrl-c, initiating graceful shutdown");
    cancel.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(3), async {
        let _ = tokio::join!(ble_task, pool_task, relay_task, server_task, log_task);
    })
    .await;

    tracing::info!("coordinator shutdown complete");
    Ok(())
}
