//! WebSocket feed and HTTP endpoints against a live listener

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use chrono::Utc;
use spread_core::{ExchangeId, MemoryStore, MonitorConfig, SpreadRecord};
use spread_hub::FanoutHub;
use spread_price_feed::SpreadPipeline;
use spread_server::{serve, AppState};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn record(token: &str, spread: f64) -> SpreadRecord {
    SpreadRecord {
        token: token.to_string(),
        spread,
        exchange_count: 2,
        timestamp: Utc::now(),
        min_price: 100.0,
        max_price: 100.0 * (1.0 + spread),
        buy_exchange: ExchangeId::new("mexc"),
        sell_exchange: ExchangeId::new("pancake"),
    }
}

async fn start() -> (SocketAddr, FanoutHub, tokio::sync::oneshot::Sender<()>) {
    let pipeline = Arc::new(SpreadPipeline::from_config(
        MonitorConfig::default(),
        Arc::new(MemoryStore::new()),
    ));
    let state = AppState::new(Arc::clone(&pipeline));
    let hub = state.hub.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown_hub = hub.clone();
    tokio::spawn(serve(listener, state, async move {
        rx.await.ok();
        shutdown_hub.close_all();
    }));

    (addr, hub, tx)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn next_json(client: &mut Client) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_subscribers(hub: &FanoutHub, n: usize) {
    for _ in 0..100 {
        if hub.subscriber_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} subscribers, have {}", hub.subscriber_count());
}

#[tokio::test]
async fn snapshot_then_updates() {
    let (addr, hub, _shutdown) = start().await;
    hub.publish(record("BTC", 0.01));
    hub.publish(record("ETH", 0.02));

    let mut client = connect(addr).await;
    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["type"], "snapshot");
    let tokens: Vec<&str> = snapshot["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["token"].as_str().unwrap())
        .collect();
    assert_eq!(tokens, vec!["BTC", "ETH"]);

    hub.publish(record("BTC", 0.03));
    let update = next_json(&mut client).await;
    assert_eq!(update["type"], "update");
    assert_eq!(update["data"]["token"], "BTC");
    assert_eq!(update["data"]["spread"], 0.03);
    assert!(update["data"]["timestamp"].is_i64());
}

#[tokio::test]
async fn ping_and_unknown_messages() {
    let (addr, _hub, _shutdown) = start().await;
    let mut client = connect(addr).await;
    assert_eq!(next_json(&mut client).await["type"], "snapshot");

    client
        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut client).await["type"], "pong");

    client
        .send(Message::Text(r#"{"type":"launch_rockets"}"#.to_string()))
        .await
        .unwrap();
    let error = next_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert!(error["data"]["message"].is_string());
}

#[tokio::test]
async fn disconnect_unregisters_subscriber() {
    let (addr, hub, _shutdown) = start().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    next_json(&mut a).await;
    next_json(&mut b).await;
    wait_subscribers(&hub, 2).await;

    a.close(None).await.unwrap();
    wait_subscribers(&hub, 1).await;

    hub.publish(record("SOL", 0.05));
    assert_eq!(next_json(&mut b).await["data"]["token"], "SOL");
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let (addr, hub, shutdown) = start().await;
    let mut client = connect(addr).await;
    next_json(&mut client).await;
    wait_subscribers(&hub, 1).await;

    shutdown.send(()).unwrap();

    let end = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = client.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(end.is_ok());
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let (addr, hub, _shutdown) = start().await;
    hub.publish(record("BTC", 0.01));

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "starting");
    assert!(health["timestamp"].is_i64());

    let stats: serde_json::Value = reqwest::get(format!("http://{addr}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["tracked_tokens"], 0);
    assert_eq!(stats["active_subscribers"], 0);
    assert_eq!(stats["skipped_cycles"], 0);
    assert_eq!(stats["proxies"]["healthy"], 0);
    assert!(stats["tokens"].is_array());
}
