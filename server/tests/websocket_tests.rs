//! End-to-end WebSocket tests against a server on an ephemeral port

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{bearer, seed_users, services, setup_test_db, test_config};
use futures::{SinkExt, StreamExt};
use lms_chat_server::db::MessageStore;
use lms_chat_server::{routing, GroupFabric, ServerState};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(pool: &sqlx::SqlitePool) -> (SocketAddr, Arc<ServerState>) {
    spawn_server_with(pool, &[]).await
}

async fn spawn_server_with(
    pool: &sqlx::SqlitePool,
    overrides: &[(&str, &str)],
) -> (SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::with_services(
        pool.clone(),
        test_config(overrides),
        services(pool),
    ));
    let app = routing::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, state)
}

async fn connect(addr: SocketAddr, query: &str, auth: Option<&str>) -> Result<Client, WsError> {
    let mut request = format!("ws://{}/ws{}", addr, query)
        .into_client_request()
        .unwrap();
    if let Some(auth) = auth {
        request
            .headers_mut()
            .insert("Authorization", auth.parse().unwrap());
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

/// Next text frame as JSON, skipping control frames
async fn next_json(ws: &mut Client) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {:?}", other),
        }
    }
}

fn refused_with(result: Result<Client, WsError>, status: u16) {
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), status),
        Err(other) => panic!("expected HTTP {}, got {:?}", status, other),
        Ok(_) => panic!("expected HTTP {}, connection was accepted", status),
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_handshake_refusals() {
    let pool = setup_test_db().await;
    let (alice, _) = seed_users(&pool).await;
    let (addr, state) = spawn_server(&pool).await;
    let auth = bearer(alice);

    refused_with(connect(addr, "?username=bob", None).await, 401);
    refused_with(connect(addr, "?username=bob", Some("Bearer nope")).await, 401);
    refused_with(connect(addr, "", Some(&auth)).await, 403);
    refused_with(connect(addr, "?username=carol", Some(&auth)).await, 403);
    refused_with(connect(addr, "?username=bob", Some(&bearer(999))).await, 403);

    assert_eq!(state.chat.fabric.group_count(), 0);
    assert_eq!(state.connection_count(), 0);
}

#[tokio::test]
async fn test_message_fans_out_to_every_receiver_connection() {
    let pool = setup_test_db().await;
    let (alice, bob) = seed_users(&pool).await;
    let (addr, state) = spawn_server(&pool).await;

    let mut alice_ws = connect(addr, "?username=bob", Some(&bearer(alice))).await.unwrap();
    let mut bob_phone = connect(addr, "?username=alice", Some(&bearer(bob))).await.unwrap();
    let mut bob_laptop = connect(addr, "?username=alice", Some(&bearer(bob))).await.unwrap();
    assert_eq!(state.chat.fabric.subscriber_count("private_bob"), 2);
    assert_eq!(state.chat.fabric.subscriber_count("private_alice"), 1);

    alice_ws
        .send(WsMessage::Text(r#"{"message":"hi"}"#.to_string()))
        .await
        .unwrap();

    let expected = serde_json::json!({"message": "hi", "sender": "alice"});
    assert_eq!(next_json(&mut bob_phone).await, expected);
    assert_eq!(next_json(&mut bob_laptop).await, expected);

    // Nothing comes back to the sender
    let echo = tokio::time::timeout(Duration::from_millis(200), next_json(&mut alice_ws)).await;
    assert!(echo.is_err());

    let rows = state.chat.store.conversation(alice, bob, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "hi");

    // And the reply goes the other way
    bob_phone
        .send(WsMessage::Text(r#"{"message":"hello"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_json(&mut alice_ws).await,
        serde_json::json!({"message": "hello", "sender": "bob"})
    );
}

#[tokio::test]
async fn test_ignored_frames_keep_connection_open() {
    let pool = setup_test_db().await;
    let (alice, bob) = seed_users(&pool).await;
    let (addr, state) = spawn_server(&pool).await;

    let mut alice_ws = connect(addr, "?username=bob", Some(&bearer(alice))).await.unwrap();
    let mut bob_ws = connect(addr, "?username=alice", Some(&bearer(bob))).await.unwrap();

    for frame in [r#"{"message":""}"#, r#"{"other":"x"}"#, "garbage"] {
        alice_ws.send(WsMessage::Text(frame.to_string())).await.unwrap();
    }
    alice_ws.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();
    alice_ws
        .send(WsMessage::Text(r#"{"message":"real"}"#.to_string()))
        .await
        .unwrap();

    // Only the real message arrives, and only it was stored
    assert_eq!(
        next_json(&mut bob_ws).await,
        serde_json::json!({"message": "real", "sender": "alice"})
    );
    let rows = state.chat.store.conversation(alice, bob, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up_subscription() {
    let pool = setup_test_db().await;
    let (alice, bob) = seed_users(&pool).await;
    let (addr, state) = spawn_server(&pool).await;

    let mut alice_ws = connect(addr, "?username=bob", Some(&bearer(alice))).await.unwrap();
    let mut bob_phone = connect(addr, "?username=alice", Some(&bearer(bob))).await.unwrap();
    let mut bob_laptop = connect(addr, "?username=alice", Some(&bearer(bob))).await.unwrap();
    assert_eq!(state.chat.fabric.subscriber_count("private_bob"), 2);
    assert_eq!(state.connection_count(), 3);

    bob_laptop.close(None).await.unwrap();
    let fabric = state.chat.fabric.clone();
    wait_for(|| fabric.subscriber_count("private_bob") == 1).await;

    alice_ws
        .send(WsMessage::Text(r#"{"message":"after"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_json(&mut bob_phone).await,
        serde_json::json!({"message": "after", "sender": "alice"})
    );

    // Abrupt drop without a close frame is cleaned up too
    drop(bob_phone);
    wait_for(|| fabric.subscriber_count("private_bob") == 0).await;
    let counted = state.clone();
    wait_for(|| counted.connection_count() == 1).await;
}

#[tokio::test]
async fn test_burst_of_messages_is_fully_persisted() {
    let pool = setup_test_db().await;
    let (alice, bob) = seed_users(&pool).await;
    let (addr, state) = spawn_server(&pool).await;

    let mut alice_ws = connect(addr, "?username=bob", Some(&bearer(alice))).await.unwrap();
    for i in 0..50 {
        alice_ws
            .send(WsMessage::Text(format!(r#"{{"message":"m{}"}}"#, i)))
            .await
            .unwrap();
    }

    let mut rows = Vec::new();
    for _ in 0..100 {
        rows = state.chat.store.conversation(alice, bob, 1000).await.unwrap();
        if rows.len() >= 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rows.len(), 50);
    let contents: Vec<String> = rows.into_iter().map(|m| m.content).collect();
    let expected: Vec<String> = (0..50).map(|i| format!("m{}", i)).collect();
    assert_eq!(contents, expected);

    // Still connected afterwards
    alice_ws
        .send(WsMessage::Text(r#"{"message":"after"}"#.to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_configured_rate_limit_closes_with_policy_code() {
    let pool = setup_test_db().await;
    let (alice, bob) = seed_users(&pool).await;
    let (addr, state) = spawn_server_with(
        &pool,
        &[("LMS_RATE_LIMIT_BURST", "2"), ("LMS_RATE_LIMIT_PER_SEC", "0")],
    )
    .await;

    let mut alice_ws = connect(addr, "?username=bob", Some(&bearer(alice))).await.unwrap();
    for i in 0..3 {
        alice_ws
            .send(WsMessage::Text(format!(r#"{{"message":"m{}"}}"#, i)))
            .await
            .unwrap();
    }

    let close = loop {
        match alice_ws.next().await {
            Some(Ok(WsMessage::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {:?}", other),
        }
    };
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Policy));

    // Frames within the allowance were stored; the one over it was not
    let rows = state.chat.store.conversation(alice, bob, 10).await.unwrap();
    let contents: Vec<&str> = rows.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m0", "m1"]);

    let fabric = state.chat.fabric.clone();
    wait_for(|| fabric.subscriber_count("private_alice") == 0).await;
}

#[tokio::test]
async fn test_per_ip_limit_refuses_then_recovers() {
    let pool = setup_test_db().await;
    let (alice, _) = seed_users(&pool).await;
    let (addr, state) = spawn_server_with(&pool, &[("LMS_MAX_CONNECTIONS_PER_IP", "1")]).await;
    let auth = bearer(alice);

    let mut first = connect(addr, "?username=bob", Some(&auth)).await.unwrap();
    refused_with(connect(addr, "?username=bob", Some(&auth)).await, 503);
    // The refused upgrade left no subscription behind
    assert_eq!(state.chat.fabric.subscriber_count("private_alice"), 1);

    first.close(None).await.unwrap();
    let counted = state.clone();
    wait_for(|| counted.connection_count() == 0).await;

    let second = connect(addr, "?username=bob", Some(&auth)).await;
    assert!(second.is_ok());
}

#[tokio::test]
async fn test_global_limit_refuses_with_service_unavailable() {
    let pool = setup_test_db().await;
    let (alice, bob) = seed_users(&pool).await;
    let (addr, _) = spawn_server_with(&pool, &[("LMS_MAX_CONNECTIONS", "1")]).await;

    let _alice_ws = connect(addr, "?username=bob", Some(&bearer(alice))).await.unwrap();
    refused_with(connect(addr, "?username=alice", Some(&bearer(bob))).await, 503);
}
