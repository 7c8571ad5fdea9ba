mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use toolbridge_common::types::{close_code, close_reason, PROTOCOL_VERSION};
use toolbridge_common::ToolExecute;
use toolbridged::{execute_tool, ToolCallError, Unhealthy};

fn request(id: &str) -> ToolExecute {
    ToolExecute {
        id: id.to_string(),
        server_name: "files".to_string(),
        tool_name: "read_file".to_string(),
        args: json!({"path": "/tmp/a"}).as_object().cloned(),
    }
}

#[tokio::test]
async fn handshake_negotiates_subprotocol_and_verifies() {
    let server = start_server().await;
    let token = mint_token("alice", "s1", 3600);

    let (mut client, proto) = TestClient::open(&server.addr, Some(&token)).await;
    assert_eq!(proto.as_deref(), Some(PROTOCOL_VERSION));
    client.identity = "alice".to_string();
    client.session_id = "s1".to_string();

    let challenge = client.expect_challenge().await;
    assert_eq!(challenge.len(), 64);
    client.answer(&challenge).await;
    assert_eq!(client.recv_json().await["type"], "challenge_verified");

    let handle = server.state.registry.get_connection("alice").unwrap();
    assert!(server.state.registry.check_connection_health(&handle).is_ok());
}

#[tokio::test]
async fn tool_call_round_trip() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    let registry = server.state.registry.clone();
    let call = tokio::spawn(async move { execute_tool(&registry, "alice", request("call-1")).await });

    let sent = client.recv_json().await;
    assert_eq!(sent["type"], "tool_execute");
    assert_eq!(sent["id"], "call-1");
    assert_eq!(sent["serverName"], "files");
    assert_eq!(sent["args"]["path"], "/tmp/a");

    client
        .send_json(&json!({"type": "tool_result", "id": "call-1", "success": true, "result": {"bytes": 3}}))
        .await;

    let result = call.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.result.unwrap()["bytes"], 3);
}

#[tokio::test]
async fn tool_failure_is_reported_in_band() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    let registry = server.state.registry.clone();
    let call = tokio::spawn(async move { execute_tool(&registry, "alice", request("c")).await });
    client.recv_json().await;
    client
        .send_json(&json!({"type": "tool_result", "id": "c", "success": false, "error": "denied"}))
        .await;

    let result = call.await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("denied"));
}

#[tokio::test]
async fn unverified_connection_is_not_dispatched_to() {
    let server = start_server().await;
    let token = mint_token("alice", "s1", 3600);
    let mut client = TestClient::connect_unverified(&server.addr, "alice", "s1", &token).await;
    client.expect_challenge().await;

    let err = execute_tool(&server.state.registry, "alice", request("a"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ToolCallError::Unhealthy(Unhealthy::ChallengeNotCompleted)
    ));
}

#[tokio::test]
async fn newer_connection_supersedes_older() {
    let server = start_server().await;
    let mut old = TestClient::connect(&server.addr, "alice", "s1").await;
    let mut new = TestClient::connect(&server.addr, "alice", "s2").await;

    let frame = old.recv_close(Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.code, CloseCode::from(close_code::NORMAL));
    assert_eq!(frame.reason, close_reason::SUPERSEDED);

    // The old socket's teardown must not evict its successor.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state.registry.len(), 1);
    assert_eq!(server.state.registry.connection_stats().metadata_entries, 1);

    let registry = server.state.registry.clone();
    let call = tokio::spawn(async move { execute_tool(&registry, "alice", request("n")).await });
    assert_eq!(new.recv_json().await["id"], "n");
    new.send_json(&json!({"type": "tool_result", "id": "n", "success": true}))
        .await;
    assert!(call.await.unwrap().unwrap().success);
}

#[tokio::test]
async fn ping_gets_pong() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    client.send_json(&json!({"type": "ping", "timestamp": 1})).await;
    let pong = client.recv_json().await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].as_u64().unwrap() > 0);

    let handle = server.state.registry.get_connection("alice").unwrap();
    let meta = server.state.registry.connection_metadata(&handle).unwrap();
    assert!(meta.last_ping.is_some());
}

#[tokio::test]
async fn invalid_message_gets_error_and_connection_survives() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    client.send_text("not json".to_string()).await;
    assert_eq!(client.recv_json().await["code"], "invalid_message");

    client
        .send_json(&json!({"type": "tool_execute", "id": "x", "serverName": "my@server", "toolName": "t"}))
        .await;
    let err = client.recv_json().await;
    assert_eq!(err["code"], "invalid_message");
    assert!(err["reason"].as_str().unwrap().contains("serverName"));

    client.send_json(&json!({"type": "pong", "timestamp": 1})).await;
    assert_eq!(client.recv_json().await["code"], "invalid_message");

    client.send_json(&json!({"type": "ping"})).await;
    assert_eq!(client.recv_json().await["type"], "pong");
}

#[tokio::test]
async fn unknown_correlation_id_is_reported() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    client
        .send_json(&json!({"type": "tool_result", "id": "nobody", "success": true}))
        .await;
    assert_eq!(client.recv_json().await["code"], "unknown_correlation_id");
}

#[tokio::test]
async fn wrong_challenge_response_closes_with_policy_violation() {
    let server = start_server().await;
    let token = mint_token("alice", "s1", 3600);
    let mut client = TestClient::connect_unverified(&server.addr, "alice", "wrong-session", &token).await;
    let challenge = client.expect_challenge().await;
    client.answer(&challenge).await;

    assert_eq!(client.recv_json().await["code"], "challenge_failed");
    let frame = client.recv_close(Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.code, CloseCode::from(close_code::POLICY_VIOLATION));
    assert_eq!(frame.reason, close_reason::CHALLENGE_FAILED);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.state.registry.get_connection("alice").is_none());
}

#[tokio::test]
async fn unanswered_challenge_times_out() {
    let server = start_server_with_config(|c| c.challenge_timeout = 1).await;
    let token = mint_token("alice", "s1", 3600);
    let mut client = TestClient::connect_unverified(&server.addr, "alice", "s1", &token).await;
    client.expect_challenge().await;

    let frame = client.recv_close(Duration::from_secs(3)).await.unwrap();
    assert_eq!(frame.code, CloseCode::from(close_code::POLICY_VIOLATION));
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let server = start_server().await;
    let (mut client, _) = TestClient::open(&server.addr, None).await;

    assert_eq!(client.recv_json().await["code"], "unauthorized");
    let frame = client.recv_close(Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.code, CloseCode::from(close_code::POLICY_VIOLATION));
    assert_eq!(frame.reason, close_reason::UNAUTHORIZED);
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn forged_token_is_unauthorized() {
    let server = start_server().await;
    let forged = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &json!({"sub": "alice", "sid": "s1", "exp": chrono::Utc::now().timestamp() + 60}),
        &jsonwebtoken::EncodingKey::from_secret(b"not-the-secret"),
    )
    .unwrap();
    let (mut client, _) = TestClient::open(&server.addr, Some(&forged)).await;

    assert_eq!(client.recv_json().await["code"], "unauthorized");
}

#[tokio::test]
async fn session_expiry_closes_connection() {
    let server = start_server().await;
    let token = mint_token("alice", "s1", 2);
    let mut client = TestClient::connect_unverified(&server.addr, "alice", "s1", &token).await;
    let challenge = client.expect_challenge().await;
    client.answer(&challenge).await;
    assert_eq!(client.recv_json().await["type"], "challenge_verified");

    let frame = client.recv_close(Duration::from_secs(4)).await.unwrap();
    assert_eq!(frame.code, CloseCode::from(close_code::POLICY_VIOLATION));
    assert_eq!(frame.reason, close_reason::SESSION_EXPIRED);
}

#[tokio::test]
async fn dropped_connection_fails_in_flight_call() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    let registry = server.state.registry.clone();
    let call = tokio::spawn(async move { execute_tool(&registry, "alice", request("lost")).await });
    client.recv_json().await;
    drop(client);

    let err = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ToolCallError::ConnectionLost));
}

#[tokio::test]
async fn concurrent_calls_on_one_connection() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    let mut calls = Vec::new();
    for id in ["a", "b", "c"] {
        let registry = server.state.registry.clone();
        calls.push(tokio::spawn(async move { execute_tool(&registry, "alice", request(id)).await }));
    }
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(client.recv_json().await["id"].as_str().unwrap().to_string());
    }
    ids.reverse();
    for id in &ids {
        client
            .send_json(&json!({"type": "tool_result", "id": id, "success": true, "result": id}))
            .await;
    }

    for (call, id) in calls.into_iter().zip(["a", "b", "c"]) {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result.id, id);
        assert_eq!(result.result.unwrap(), json!(id));
    }
}

#[tokio::test]
async fn shutdown_closes_connected_clients() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "alice", "s1").await;

    server.shutdown.send(()).unwrap();

    let frame = client.recv_close(Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame.code, CloseCode::from(close_code::NORMAL));
    assert_eq!(frame.reason, close_reason::SHUTDOWN);
}
