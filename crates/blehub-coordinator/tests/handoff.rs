//! End-to-end exercises of the agent channel: a real WebSocket server and
//! pool, driven by scripted agents (and once by the real forwarder). No BLE
//! hardware involved; the BLE-facing behaviors are covered by the pool's
//! unit tests.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use blehub_agent::{Forwarder, ForwarderConfig};
use blehub_ble::{Endpoint, EndpointConfig, EndpointHandle};
use blehub_coordinator::pool::{NodePool, PoolConfig, PoolHandle, PoolSnapshot};
use blehub_coordinator::router::Router;
use blehub_coordinator::server::AgentServer;
use blehub_proto::frame;
use blehub_proto::wire::{AgentMessage, CoordinatorMessage, ScanDevice};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_coordinator(token: &str) -> (SocketAddr, PoolHandle, CancellationToken) {
    let cancel = CancellationToken::new();
    let config = PoolConfig {
        scan_duration: Duration::from_millis(100),
        scan_slack: Duration::from_millis(100),
        handoff_timeout: Duration::from_millis(500),
        command_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    };
    let (pool, handle) = NodePool::new(config, cancel.clone());
    tokio::spawn(pool.run());

    let server = AgentServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        token.to_string(),
        handle.clone(),
        cancel.clone(),
    )
    .await
    .expect("bind agent channel");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());

    (addr, handle, cancel)
}

async fn connect_agent(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
        .await
        .expect("connect to coordinator");
    ws
}

async fn send(ws: &mut WsClient, msg: &AgentMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text)).await.expect("ws send");
}

/// Read messages until one matches, skipping everything else (including
/// transport frames).
async fn recv_matching(
    ws: &mut WsClient,
    timeout: Duration,
    pred: impl Fn(&CoordinatorMessage) -> bool,
) -> CoordinatorMessage {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for coordinator message")
            .expect("link ended while waiting")
            .expect("ws read error");
        if let Message::Text(text) = msg {
            if let Some(decoded) = CoordinatorMessage::decode(&text) {
                if pred(&decoded) {
                    return decoded;
                }
            }
        }
    }
}

async fn wait_for_snapshot(
    pool: &PoolHandle,
    timeout: Duration,
    pred: impl Fn(&PoolSnapshot) -> bool,
) -> PoolSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = pool.snapshot();
        if pred(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for pool state, last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A local endpoint whose actor never runs: the coordinator has no radio.
fn absent_local() -> EndpointHandle {
    let (endpoint, handle) = Endpoint::new(EndpointConfig::default(), CancellationToken::new());
    drop(endpoint);
    handle
}

async fn authenticate(ws: &mut WsClient, token: &str, node_id: &str) {
    send(
        ws,
        &AgentMessage::Auth {
            token: token.into(),
            node_id: Some(node_id.into()),
        },
    )
    .await;
    let result = recv_matching(ws, Duration::from_secs(3), |m| {
        matches!(m, CoordinatorMessage::AuthResult { .. })
    })
    .await;
    assert_eq!(result, CoordinatorMessage::AuthResult { success: true });
}

// ---------------------------------------------------------------------------
// Cold start with one agent: scan, elect, promote, command round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_handoff_and_command_round_trip() {
    let (addr, pool, cancel) = start_coordinator("secret").await;
    let mut ws = connect_agent(addr).await;

    authenticate(&mut ws, "secret", "porch").await;
    send(
        &mut ws,
        &AgentMessage::Status {
            ble_connected: false,
            battery: None,
        },
    )
    .await;

    // Registration with no writer anywhere fires a handoff: scan broadcast.
    let scan = recv_matching(&mut ws, Duration::from_secs(3), |m| {
        matches!(m, CoordinatorMessage::Scan { .. })
    })
    .await;
    assert_eq!(
        scan,
        CoordinatorMessage::Scan {
            duration: Some(100),
        }
    );

    let report = AgentMessage::ScanResult {
        devices: vec![ScanDevice {
            address: None,
            name: Some("collar".into()),
            rssi: -55,
            detection_method: None,
        }],
    };
    send(&mut ws, &report).await;

    // After the scan window plus slack the election picks us. A slow run
    // may roll into a retry cycle first; answer any repeated scan.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for connect")
            .expect("link ended while waiting")
            .expect("ws read error");
        match msg {
            Message::Text(text) => match CoordinatorMessage::decode(&text) {
                Some(CoordinatorMessage::Connect) => break,
                Some(CoordinatorMessage::Scan { .. }) => send(&mut ws, &report).await,
                _ => {}
            },
            _ => {}
        }
    }

    send(
        &mut ws,
        &AgentMessage::Status {
            ble_connected: true,
            battery: Some(90),
        },
    )
    .await;
    let snapshot = wait_for_snapshot(&pool, Duration::from_secs(3), |s| {
        s.active.as_deref() == Some("porch")
    })
    .await;
    assert_eq!(snapshot.nodes.len(), 1);
    assert!(snapshot.nodes[0].ble_connected);

    // Now route a command through the pool and confirm it from the agent.
    let router = Router::new(absent_local(), pool.clone());
    let submit = tokio::spawn(async move { router.submit(frame::encode_command(50.0, 0.0, 0.0)).await });

    let first = recv_matching(&mut ws, Duration::from_secs(3), |m| {
        matches!(m, CoordinatorMessage::Command { .. })
    })
    .await;
    let CoordinatorMessage::Command { id, data } = first else {
        unreachable!()
    };
    assert_eq!(data, "aa07320000bb");
    send(&mut ws, &AgentMessage::CommandResult { id, success: true }).await;

    let outcome = submit.await.expect("submit task");
    assert_eq!(outcome, Ok(true));

    // The reliability policy repeats command frames 300 ms later.
    let second = recv_matching(&mut ws, Duration::from_secs(3), |m| {
        matches!(m, CoordinatorMessage::Command { .. })
    })
    .await;
    let CoordinatorMessage::Command { id: second_id, data: second_data } = second else {
        unreachable!()
    };
    assert_eq!(second_data, "aa07320000bb");
    assert_eq!(second_id, id + 1);
    send(
        &mut ws,
        &AgentMessage::CommandResult {
            id: second_id,
            success: true,
        },
    )
    .await;

    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Duplicate connection collision
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_device_holder_yields_to_incumbent() {
    // Empty token: authentication disabled, any token passes.
    let (addr, pool, cancel) = start_coordinator("").await;

    let mut ws_a = connect_agent(addr).await;
    authenticate(&mut ws_a, "whatever", "a").await;
    send(
        &mut ws_a,
        &AgentMessage::Status {
            ble_connected: true,
            battery: None,
        },
    )
    .await;
    wait_for_snapshot(&pool, Duration::from_secs(3), |s| {
        s.active.as_deref() == Some("a")
    })
    .await;

    let mut ws_b = connect_agent(addr).await;
    authenticate(&mut ws_b, "", "b").await;
    send(
        &mut ws_b,
        &AgentMessage::Status {
            ble_connected: true,
            battery: None,
        },
    )
    .await;

    // The latecomer is told to drop its link; the incumbent keeps it.
    recv_matching(&mut ws_b, Duration::from_secs(3), |m| {
        matches!(m, CoordinatorMessage::DisconnectBle)
    })
    .await;
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.active.as_deref(), Some("a"));

    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Authentication edges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wrong_token_is_refused_and_link_closed() {
    let (addr, _pool, cancel) = start_coordinator("secret").await;
    let mut ws = connect_agent(addr).await;

    send(
        &mut ws,
        &AgentMessage::Auth {
            token: "wrong".into(),
            node_id: Some("x".into()),
        },
    )
    .await;

    let result = recv_matching(&mut ws, Duration::from_secs(3), |m| {
        matches!(m, CoordinatorMessage::AuthResult { .. })
    })
    .await;
    assert_eq!(result, CoordinatorMessage::AuthResult { success: false });

    // The server closes the link after the refusal.
    let end = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "link should close after auth failure");

    cancel.cancel();
}

#[tokio::test]
async fn first_message_other_than_auth_is_refused() {
    let (addr, pool, cancel) = start_coordinator("secret").await;
    let mut ws = connect_agent(addr).await;

    send(
        &mut ws,
        &AgentMessage::Status {
            ble_connected: true,
            battery: None,
        },
    )
    .await;

    let result = recv_matching(&mut ws, Duration::from_secs(3), |m| {
        matches!(m, CoordinatorMessage::AuthResult { .. })
    })
    .await;
    assert_eq!(result, CoordinatorMessage::AuthResult { success: false });
    assert!(pool.snapshot().nodes.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn malformed_text_after_auth_does_not_close_the_link() {
    let (addr, pool, cancel) = start_coordinator("").await;
    let mut ws = connect_agent(addr).await;
    authenticate(&mut ws, "", "tolerant").await;

    ws.send(Message::Text("this is not json {{{".into()))
        .await
        .expect("send garbage");
    ws.send(Message::Text(r#"{"no_type": true}"#.into()))
        .await
        .expect("send typeless");

    // The link is still alive and dispatching.
    send(
        &mut ws,
        &AgentMessage::Status {
            ble_connected: true,
            battery: Some(42),
        },
    )
    .await;
    let snapshot = wait_for_snapshot(&pool, Duration::from_secs(3), |s| {
        s.active.as_deref() == Some("tolerant")
    })
    .await;
    assert_eq!(snapshot.nodes[0].last_battery, Some(42));

    cancel.cancel();
}

// ---------------------------------------------------------------------------
// The real forwarder against the real server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn real_forwarder_registers_and_reports_status() {
    let (addr, pool, cancel) = start_coordinator("secret").await;

    // The forwarder gets an endpoint whose actor never runs: no radio on
    // this host, every BLE operation reports failure/not-ready.
    let (endpoint, endpoint_handle) =
        Endpoint::new(EndpointConfig::default(), CancellationToken::new());
    drop(endpoint);

    let forwarder = Forwarder::new(
        ForwarderConfig::new(format!("ws://{addr}/"), "secret".into(), Some("it-agent".into())),
        endpoint_handle,
        cancel.clone(),
    );
    tokio::spawn(forwarder.run());

    // Auth succeeds and the immediate status report lands in the pool.
    let snapshot = wait_for_snapshot(&pool, Duration::from_secs(5), |s| {
        s.nodes.iter().any(|n| n.node_id == "it-agent")
    })
    .await;
    let node = &snapshot.nodes[0];
    assert!(!node.ble_connected);
    assert_eq!(node.last_battery, None);
    assert_eq!(snapshot.active, None);

    cancel.cancel();
}
