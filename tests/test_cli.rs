//! Command line tests against the built binary
mod common;

use std::process::Stdio;

use assert_cmd::Command;
use common::{echo_cluster, PROMPTLY};
use predicates::prelude::*;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn podtunnel() -> Command {
    let mut cmd = Command::cargo_bin("podtunnel").unwrap();
    cmd.env_remove("PODTUNNEL_TOKEN").env_remove("PODTUNNEL_KUBECONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_options() {
    podtunnel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pods/<name>.<namespace>:<port>"))
        .stdout(predicate::str::contains("--local-port"))
        .stdout(predicate::str::contains("--kubeconfig"));
}

#[test]
fn test_missing_target_is_usage_error() {
    podtunnel().assert().failure().code(2);
}

#[test]
fn test_invalid_target_fails_before_connecting() {
    podtunnel()
        .args(["--server", "http://127.0.0.1:1", "svc/demo.default:80"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid target"));
}

#[test]
fn test_rejects_non_http_server() {
    podtunnel()
        .args(["--server", "ftp://example.org", "pods/demo.default:80"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config error"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwards_local_port() {
    let mock = echo_cluster().await;

    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_podtunnel"))
        .args(["--server", &mock.url(), "--token", "test-token", "--local-port", "0"])
        .arg("pods/demo.default:8080")
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let line = timeout(PROMPTLY, BufReader::new(stdout).lines().next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    // "Forwarding from 127.0.0.1:<port> -> 8080"
    let local = line
        .strip_prefix("Forwarding from ")
        .and_then(|rest| rest.split(" -> ").next())
        .unwrap()
        .to_string();
    assert!(line.ends_with("-> 8080"), "{}", line);

    let mut socket = TcpStream::connect(&local).await.unwrap();
    socket.write_all(b"through the tunnel").await.unwrap();
    socket.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    timeout(PROMPTLY, socket.read_to_end(&mut echoed)).await.unwrap().unwrap();
    assert_eq!(echoed, b"through the tunnel");
    assert_eq!(mock.upgrade_count(), 1);
    assert_eq!(mock.authorizations(), vec![Some("Bearer test-token".to_string())]);

    child.kill().await.unwrap();
}
