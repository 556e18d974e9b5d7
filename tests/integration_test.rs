// tests/integration_test.rs

//! Black-box tests that drive the JSON-RPC socket directly: start a real
//! server on an ephemeral port against a temporary config file, connect a
//! plain TCP client, and exchange newline-delimited JSON exactly as a real
//! client would.

use serde_json::{json, Value};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream as AsyncTcpStream;
use tokio::time::timeout;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn send_request(
    stream: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    request: Value,
) -> Value {
    let mut line = serde_json::to_vec(&request).unwrap();
    line.push(b'\n');
    writer.write_all(&line).await.unwrap();

    let mut response_line = String::new();
    timeout(Duration::from_secs(5), stream.read_line(&mut response_line))
        .await
        .expect("timed out waiting for response")
        .unwrap();
    serde_json::from_str(&response_line).unwrap()
}

async fn start_server(config_path: std::path::PathBuf, port: u16) {
    let config = spallocd::config::Config {
        host: "127.0.0.1".to_string(),
        port,
        timeout_check_interval: Duration::from_millis(20),
        ..spallocd::config::Config::default()
    };
    tokio::spawn(spallocd::server::run(config, config_path, true));
    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn version_command_round_trips() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("spalloc.cfg");
    std::fs::write(&config_path, "").unwrap();
    let port = find_free_port();
    start_server(config_path, port).await;

    let stream = AsyncTcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let resp = send_request(&mut reader, &mut write_half, json!({"command": "version"})).await;
    assert!(resp["return"].is_string());
}

#[tokio::test]
async fn create_job_then_get_state_then_destroy() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("spalloc.cfg");
    std::fs::write(&config_path, "").unwrap();
    let port = find_free_port();
    start_server(config_path, port).await;

    let stream = AsyncTcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "create_job", "args": [], "kwargs": {"owner": "alice"}}),
    )
    .await;
    let job_id = resp["return"].as_u64().expect("create_job returns an id");

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "get_job_state", "args": [job_id]}),
    )
    .await;
    assert_eq!(resp["return"]["state"], json!("queued"));

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "destroy_job", "args": [job_id, "test finished"]}),
    )
    .await;
    assert_eq!(resp["return"], Value::Null);

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "get_job_state", "args": [job_id]}),
    )
    .await;
    assert_eq!(resp["return"]["state"], json!("destroyed"));
    assert_eq!(resp["return"]["reason"], json!("test finished"));
}

#[tokio::test]
async fn unknown_command_disconnects_client() {
    use tokio::io::AsyncReadExt;

    let dir = tempdir().unwrap();
    let config_path = dir.path().join("spalloc.cfg");
    std::fs::write(&config_path, "").unwrap();
    let port = find_free_port();
    start_server(config_path, port).await;

    let mut stream = AsyncTcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"{\"command\":\"not_a_real_command\"}\n")
        .await
        .unwrap();

    // The server closes the connection rather than replying with an error
    // envelope; a subsequent read should hit EOF.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("timed out waiting for disconnect")
        .unwrap();
    assert_eq!(n, 0, "expected the server to close the connection");
}

#[tokio::test]
async fn notify_job_then_keepalive_expiry_delivers_jobs_changed() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("spalloc.cfg");
    std::fs::write(&config_path, "").unwrap();
    let port = find_free_port();
    start_server(config_path, port).await;

    let stream = AsyncTcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "create_job", "kwargs": {"owner": "bob", "keepalive": 0}}),
    )
    .await;
    let job_id = resp["return"].as_u64().unwrap();

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "notify_job", "args": [job_id]}),
    )
    .await;
    assert_eq!(resp["return"], Value::Null);

    // The job's keepalive deadline is effectively already in the past
    // (keepalive=0); the next periodic tick should destroy it and fan out
    // a jobs_changed notification on this connection.
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for jobs_changed notification")
        .unwrap();
    let notification: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(notification["jobs_changed"], json!([job_id]));
}

#[tokio::test]
async fn direct_destroy_job_delivers_jobs_changed() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("spalloc.cfg");
    std::fs::write(&config_path, "").unwrap();
    let port = find_free_port();
    start_server(config_path, port).await;

    let stream = AsyncTcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "create_job", "kwargs": {"owner": "dave"}}),
    )
    .await;
    let job_id = resp["return"].as_u64().unwrap();

    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "notify_job", "args": [job_id]}),
    )
    .await;
    assert_eq!(resp["return"], Value::Null);

    // A direct, client-initiated destroy_job (no keepalive expiry involved)
    // must itself fan out a jobs_changed notification on the next tick.
    let resp = send_request(
        &mut reader,
        &mut write_half,
        json!({"command": "destroy_job", "args": [job_id, "done"]}),
    )
    .await;
    assert_eq!(resp["return"], Value::Null);

    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for jobs_changed notification")
        .unwrap();
    let notification: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(notification["jobs_changed"], json!([job_id]));
}
