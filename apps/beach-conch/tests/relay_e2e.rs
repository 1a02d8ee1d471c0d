mod common;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
};
use beach_conch::{
    config::ServerConfig,
    server::{self, AppState},
    telemetry::detached_metrics_handle,
};
use common::{eventually, test_config, within, ScriptedConnector};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::util::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(config: ServerConfig) -> (Arc<AppState>, SocketAddr) {
    let (state, _pump) = AppState::new(
        &config,
        Arc::new(ScriptedConnector::default()),
        detached_metrics_handle(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_ws(
        listener,
        state.clone(),
        std::future::pending::<()>(),
    ));
    (state, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) = connect_async(format!("ws://{addr}/")).await.unwrap();
    client
}

/// Connects `count` clients and waits until the server has registered all of them.
async fn connect_all(state: &AppState, addr: SocketAddr, count: usize) -> Vec<Client> {
    let mut clients = Vec::with_capacity(count);
    for _ in 0..count {
        clients.push(connect(addr).await);
    }
    assert!(eventually(|| state.registry().len() == count).await);
    clients
}

async fn next_data(client: &mut Client, millis: u64) -> Option<Message> {
    loop {
        match within(millis, client.next()).await {
            Some(Some(Ok(message @ (Message::Binary(_) | Message::Text(_))))) => {
                return Some(message)
            }
            Some(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn binary_frame_reaches_every_other_client_exactly_once() {
    let (state, addr) = start(test_config()).await;
    let mut clients = connect_all(&state, addr, 3).await;
    let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];

    clients[0]
        .send(Message::Binary(payload.clone()))
        .await
        .unwrap();

    for receiver in &mut clients[1..] {
        assert_eq!(
            next_data(receiver, 2_000).await,
            Some(Message::Binary(payload.clone()))
        );
    }
    for client in &mut clients {
        assert_eq!(next_data(client, 200).await, None);
    }
}

#[test_timeout::tokio_timeout_test]
async fn stray_candidate_gets_no_reply_and_relay_keeps_serving() {
    let (state, addr) = start(test_config()).await;
    let mut clients = connect_all(&state, addr, 3).await;

    let stray = json!({
        "type": "new-ice-candidate",
        "candidate": {"candidate": "candidate:0 1 UDP 2122252543 10.0.0.2 50000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
    });
    clients[0]
        .send(Message::Text(stray.to_string()))
        .await
        .unwrap();
    for client in &mut clients {
        assert_eq!(next_data(client, 200).await, None);
    }

    clients[1]
        .send(Message::Binary(vec![1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(
        next_data(&mut clients[0], 2_000).await,
        Some(Message::Binary(vec![1, 2, 3]))
    );
    assert_eq!(
        next_data(&mut clients[2], 2_000).await,
        Some(Message::Binary(vec![1, 2, 3]))
    );
    assert_eq!(state.registry().len(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn plain_text_is_never_broadcast() {
    let (state, addr) = start(test_config()).await;
    let mut clients = connect_all(&state, addr, 2).await;
    clients[0]
        .send(Message::Text("hello everyone".into()))
        .await
        .unwrap();
    assert_eq!(next_data(&mut clients[1], 200).await, None);
}

#[test_timeout::tokio_timeout_test]
async fn error_replies_report_rejected_envelopes() {
    let mut config = test_config();
    config.error_replies = true;
    let (state, addr) = start(config).await;
    let mut clients = connect_all(&state, addr, 1).await;
    let client = &mut clients[0];

    client.send(Message::Text("{not json".into())).await.unwrap();
    let Some(Message::Text(reply)) = next_data(client, 2_000).await else {
        panic!("expected an error envelope");
    };
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["reason"], "malformed_envelope");

    // Unknown types stay silent even with error replies on.
    client
        .send(Message::Text(json!({"type": "mystery"}).to_string()))
        .await
        .unwrap();
    assert_eq!(next_data(client, 200).await, None);
}

#[test_timeout::tokio_timeout_test]
async fn named_peers_exchange_offers_through_the_server() {
    let (state, addr) = start(test_config()).await;
    let mut clients = connect_all(&state, addr, 2).await;

    clients[1]
        .send(Message::Text(json!({"type": "join", "name": "bob"}).to_string()))
        .await
        .unwrap();
    assert!(eventually(|| state.registry().lookup("bob").is_ok()).await);

    let offer = json!({
        "type": "audio-offer",
        "name": "alice",
        "target": "bob",
        "sdp": {"type": "offer", "sdp": "v=0\r\n"}
    });
    clients[0]
        .send(Message::Text(offer.to_string()))
        .await
        .unwrap();
    let Some(Message::Text(forwarded)) = next_data(&mut clients[1], 2_000).await else {
        panic!("expected the forwarded offer");
    };
    let forwarded: Value = serde_json::from_str(&forwarded).unwrap();
    assert_eq!(forwarded["type"], "audio-offer");
    assert_eq!(forwarded["name"], "alice");
    assert_eq!(forwarded["sdp"]["sdp"], "v=0\r\n");

    let answer = json!({
        "type": "audio-answer",
        "name": "bob",
        "target": "alice",
        "sdp": "v=0\r\n"
    });
    clients[1]
        .send(Message::Text(answer.to_string()))
        .await
        .unwrap();
    let Some(Message::Text(answered)) = next_data(&mut clients[0], 2_000).await else {
        panic!("expected the forwarded answer");
    };
    let answered: Value = serde_json::from_str(&answered).unwrap();
    assert_eq!(answered["type"], "audio-answer");
    assert_eq!(answered["name"], "bob");
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_unregisters_and_tears_down() {
    let (state, addr) = start(test_config()).await;
    let mut clients = connect_all(&state, addr, 2).await;

    let offer = json!({"type": "audio-offer", "sdp": "v=0\r\n"});
    clients[0]
        .send(Message::Text(offer.to_string()))
        .await
        .unwrap();
    assert!(matches!(
        next_data(&mut clients[0], 2_000).await,
        Some(Message::Text(_))
    ));
    assert_eq!(state.coordinator().active_contexts(), 1);

    let mut first = clients.remove(0);
    first.close(None).await.unwrap();
    drop(first);
    assert!(eventually(|| state.registry().len() == 1).await);
    assert!(eventually(|| state.coordinator().active_contexts() == 0).await);
}

#[test_timeout::tokio_timeout_test]
async fn operational_endpoints_respond() {
    let (state, _pump) = AppState::new(
        &test_config(),
        Arc::new(ScriptedConnector::default()),
        detached_metrics_handle(),
    );
    let app = server::ws_router(state);

    let response = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(
        serde_json::from_slice::<Value>(&bytes).unwrap(),
        json!({"status": "ok"})
    );

    let response = app
        .clone()
        .oneshot(Request::get("/debug/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let stats: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(stats["active_connections"], 0);
    assert_eq!(stats["media_type"], "audio/webm; codecs=opus");
    assert_eq!(stats["recording_enabled"], false);

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
