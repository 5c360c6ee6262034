//! WebSocket sessions against a real listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actor_runtime::config::RpcConfig;
use actor_runtime::{server, ActorBuilder, ActorConfig, ActorInstance, ActorMetadata, MemoryKv};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start() -> (ActorInstance, SocketAddr) {
    start_with(ActorConfig::default()).await
}

async fn start_with(config: ActorConfig) -> (ActorInstance, SocketAddr) {
    let def = ActorBuilder::new("counter")
        .config(config)
        .on_initialize(|| async { Ok(json!({ "count": 0 })) })
        .on_before_connect(|_, req| async move {
            if req.parameters["token"] == "bad" {
                anyhow::bail!(actor_runtime::ActorError::user("forbidden", "bad token"));
            }
            Ok(json!({ "token": req.parameters["token"] }))
        })
        .rpc("increment", |ctx, args| async move {
            let by: i64 = args.get(0)?;
            let count = ctx.state().update(|state| {
                let next = state["count"].as_i64().unwrap_or(0) + by;
                state["count"] = json!(next);
                next
            })?;
            ctx.actor().broadcast("changed", vec![json!(count)])?;
            Ok(count)
        })
        .rpc("whoami", |ctx, _| async move { Ok(ctx.connection().state()?) })
        .rpc("sleep", |_, args| async move {
            let ms: u64 = args.get(0)?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .build();
    let actor = ActorInstance::new(def, Arc::new(MemoryKv::new()), ActorMetadata::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, actor.clone()));
    actor.boot().await.unwrap();
    (actor, addr)
}

async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/connect?{query}")).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::text(frame.to_string())).await.unwrap();
}

/// Read frames until an event called `name` arrives.
async fn recv_event(socket: &mut Socket, name: &str) -> Value {
    loop {
        let frame = recv(socket).await;
        if frame["body"]["ev"]["n"] == name {
            return frame["body"]["ev"]["a"].clone();
        }
    }
}

async fn assert_silent(socket: &mut Socket, window: Duration) {
    if let Ok(next) = tokio::time::timeout(window, socket.next()).await {
        panic!("expected no frames, got {next:?}");
    }
}

async fn recv(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn subscribed_clients_receive_broadcasts() {
    let (_actor, addr) = start().await;
    let mut watcher = connect(addr, "format=json").await;
    let mut caller = connect(addr, "format=json").await;

    send(&mut watcher, json!({ "body": { "sr": { "e": "changed", "s": true } } })).await;
    // Round trip so the subscription is registered before the broadcast.
    send(&mut watcher, json!({ "body": { "rr": { "i": 1, "n": "increment", "a": [0] } } })).await;
    let frames = [recv(&mut watcher).await, recv(&mut watcher).await];
    assert!(frames.contains(&json!({ "body": { "ro": { "i": 1, "o": 0 } } })));

    send(&mut caller, json!({ "body": { "rr": { "i": 7, "n": "increment", "a": [5] } } })).await;
    assert_eq!(recv(&mut caller).await, json!({ "body": { "ro": { "i": 7, "o": 5 } } }));
    assert_eq!(
        recv(&mut watcher).await,
        json!({ "body": { "ev": { "n": "changed", "a": [5] } } })
    );
}

#[tokio::test]
async fn responses_are_correlated_by_id() {
    let (_actor, addr) = start().await;
    let mut socket = connect(addr, "format=json").await;

    send(&mut socket, json!({ "body": { "rr": { "i": 1, "n": "sleep", "a": [300] } } })).await;
    send(&mut socket, json!({ "body": { "rr": { "i": 2, "n": "sleep", "a": [10] } } })).await;

    assert_eq!(recv(&mut socket).await["body"]["ro"]["i"], 2);
    assert_eq!(recv(&mut socket).await["body"]["ro"]["i"], 1);
}

#[tokio::test]
async fn connection_state_comes_from_before_connect() {
    let (_actor, addr) = start().await;
    // {"token":"abc"}
    let params = "%7B%22token%22%3A%22abc%22%7D";
    let mut socket = connect(addr, &format!("format=json&params={params}")).await;

    send(&mut socket, json!({ "body": { "rr": { "i": 1, "n": "whoami", "a": [] } } })).await;
    assert_eq!(
        recv(&mut socket).await,
        json!({ "body": { "ro": { "i": 1, "o": { "token": "abc" } } } })
    );
}

#[tokio::test]
async fn refused_and_malformed_connections() {
    let (_actor, addr) = start().await;

    assert!(connect_async(format!("ws://{addr}/connect")).await.is_err(), "format is required");
    assert!(
        connect_async(format!("ws://{addr}/connect?format=json&params=%7B%22token%22%3A%22bad%22%7D"))
            .await
            .is_err(),
        "before-connect refusal aborts the upgrade"
    );

    let mut socket = connect(addr, "format=json").await;
    socket.send(Message::text("not json")).await.unwrap();
    assert_eq!(recv(&mut socket).await["body"]["er"]["c"], "malformed_message");

    send(&mut socket, json!({ "body": { "rr": { "i": 3, "n": "_hidden", "a": [] } } })).await;
    assert_eq!(recv(&mut socket).await["body"]["re"]["c"], "rpc_not_found");
}

#[tokio::test]
async fn inspector_sees_state_and_connections() {
    let (_actor, addr) = start().await;
    let mut client = connect(addr, "format=json").await;
    send(&mut client, json!({ "body": { "rr": { "i": 1, "n": "increment", "a": [1] } } })).await;
    recv(&mut client).await;

    let (mut inspector, _) = connect_async(format!("ws://{addr}/__inspect/connect?format=json"))
        .await
        .unwrap();

    send(&mut inspector, json!({ "body": { "rr": { "i": 1, "n": "setState", "a": [{ "count": 42 }] } } })).await;
    assert_eq!(recv(&mut inspector).await["body"]["ro"]["i"], 1);

    send(&mut inspector, json!({ "body": { "rr": { "i": 2, "n": "inspect", "a": [] } } })).await;
    let resp = recv(&mut inspector).await;
    let out = &resp["body"]["ro"]["o"];
    assert_eq!(out["rpcs"], json!(["increment", "sleep", "whoami"]));
    assert_eq!(out["state"]["enabled"], true);
    assert_eq!(out["state"]["native"], r#"{"count":42}"#);
    assert_eq!(out["connections"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn shutdown_waits_for_close_acknowledgement() {
    let (actor, addr) = start().await;
    let mut socket = connect(addr, "format=json").await;
    send(&mut socket, json!({ "body": { "rr": { "i": 1, "n": "increment", "a": [1] } } })).await;
    recv(&mut socket).await;

    // Reading past the close frame flushes the client's reply.
    let client = tokio::spawn(async move {
        let mut saw_close = false;
        while let Some(Ok(msg)) = socket.next().await {
            if let Message::Close(_) = msg {
                saw_close = true;
            }
        }
        saw_close
    });

    let started = Instant::now();
    actor.shutdown().await;
    assert!(started.elapsed() < Duration::from_millis(1000), "acknowledged close should not hit the drain timeout");
    assert!(client.await.unwrap(), "client receives a close frame");
}

#[tokio::test]
async fn shutdown_gives_up_on_silent_clients() {
    let (actor, addr) = start().await;
    let mut socket = connect(addr, "format=json").await;
    send(&mut socket, json!({ "body": { "rr": { "i": 1, "n": "increment", "a": [1] } } })).await;
    recv(&mut socket).await;

    // The client never reads again, so it never answers the close frame.
    let started = Instant::now();
    actor.shutdown().await;
    let took = started.elapsed();
    assert!(took >= Duration::from_millis(1400), "shutdown returned after {took:?}");
    assert!(took < Duration::from_secs(3), "shutdown returned after {took:?}");
    drop(socket);
}

#[tokio::test]
async fn timed_out_rpc_leaves_socket_usable() {
    let config = ActorConfig {
        rpc: RpcConfig {
            timeout: Duration::from_millis(200),
        },
        ..ActorConfig::default()
    };
    let (_actor, addr) = start_with(config).await;
    let mut socket = connect(addr, "format=json").await;

    send(&mut socket, json!({ "body": { "rr": { "i": 1, "n": "sleep", "a": [1000] } } })).await;
    let resp = recv(&mut socket).await;
    assert_eq!(resp["body"]["re"]["i"], 1);
    assert_eq!(resp["body"]["re"]["c"], "rpc_timed_out");

    send(&mut socket, json!({ "body": { "rr": { "i": 2, "n": "increment", "a": [2] } } })).await;
    assert_eq!(recv(&mut socket).await, json!({ "body": { "ro": { "i": 2, "o": 2 } } }));
}

#[tokio::test]
async fn oversized_frames_get_an_error_envelope() {
    let (_actor, addr) = start().await;
    let mut socket = connect(addr, "format=json").await;

    let big = "x".repeat(70 * 1024);
    send(&mut socket, json!({ "body": { "rr": { "i": 1, "n": "increment", "a": [big] } } })).await;
    assert_eq!(recv(&mut socket).await["body"]["er"]["c"], "message_too_long");

    send(&mut socket, json!({ "body": { "rr": { "i": 2, "n": "increment", "a": [1] } } })).await;
    assert_eq!(recv(&mut socket).await["body"]["ro"]["o"], 1);
}

#[tokio::test]
async fn cbor_sockets_use_binary_frames() {
    let (_actor, addr) = start().await;
    let mut socket = connect(addr, "format=cbor").await;

    let mut request = Vec::new();
    let frame = json!({ "body": { "rr": { "i": 4, "n": "increment", "a": [3] } } });
    ciborium::ser::into_writer(&frame, &mut request).unwrap();
    socket.send(Message::binary(request)).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(bytes) = msg else {
        panic!("expected a binary frame, got {msg:?}");
    };
    let resp: Value = ciborium::de::from_reader(&bytes[..]).unwrap();
    assert_eq!(resp, json!({ "body": { "ro": { "i": 4, "o": 3 } } }));
}

#[tokio::test]
async fn change_notifications_reach_inspectors_only() {
    let (_actor, addr) = start().await;
    let (mut inspector, _) = connect_async(format!("ws://{addr}/__inspect/connect?format=json"))
        .await
        .unwrap();
    for event in ["_state-changed", "_connections-changed", "_event-emitted"] {
        send(&mut inspector, json!({ "body": { "sr": { "e": event, "s": true } } })).await;
    }
    send(&mut inspector, json!({ "body": { "rr": { "i": 1, "n": "inspect", "a": [] } } })).await;
    assert_eq!(recv(&mut inspector).await["body"]["ro"]["i"], 1);

    let mut client = connect(addr, "format=json").await;
    let connections = recv_event(&mut inspector, "_connections-changed").await;
    assert_eq!(connections[0].as_array().map(Vec::len), Some(1));

    send(&mut client, json!({ "body": { "sr": { "e": "_state-changed", "s": true } } })).await;
    send(&mut client, json!({ "body": { "rr": { "i": 1, "n": "increment", "a": [7] } } })).await;
    assert_eq!(recv(&mut client).await, json!({ "body": { "ro": { "i": 1, "o": 7 } } }));

    let state = recv_event(&mut inspector, "_state-changed").await;
    assert_eq!(state[0]["native"], r#"{"count":7}"#);
    let emitted = recv_event(&mut inspector, "_event-emitted").await;
    assert_eq!(emitted[0]["name"], "changed");

    assert_silent(&mut client, Duration::from_millis(700)).await;
}
