use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const SESSION: &str = "12345678-1234-1234-1234-123456789012";

fn tetherd(state_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("tetherd").unwrap();
    cmd.env_clear()
        .env("TETHER_STATE_DIR", state_dir)
        .env("TETHER_CONFIG", state_dir.join("absent.toml"))
        .timeout(Duration::from_secs(10));
    cmd
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    tetherd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("heartbeat"))
        .stdout(predicate::str::contains("await-approval"));
}

#[test]
fn heartbeat_rejects_invalid_session() {
    let dir = tempfile::tempdir().unwrap();
    tetherd(dir.path())
        .args(["heartbeat", "--session-id", "../../etc/passwd"])
        .assert()
        .failure();
    assert!(!dir.path().join("heartbeat-../../etc/passwd.json").exists());
}

#[test]
fn heartbeat_without_relay_exits_without_marker() {
    let dir = tempfile::tempdir().unwrap();
    tetherd(dir.path())
        .args(["heartbeat", "--session-id", SESSION])
        .assert()
        .failure();

    assert!(!dir.path().join(format!("heartbeat-{SESSION}.json")).exists());
    let log = std::fs::read_to_string(dir.path().join("tether.log")).unwrap();
    assert!(log.contains("relay unavailable"), "{log}");
}

#[test]
fn await_approval_requires_deadline() {
    let dir = tempfile::tempdir().unwrap();
    tetherd(dir.path())
        .args([
            "await-approval",
            "--session-id",
            SESSION,
            "--approval-id",
            "apr-1",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--deadline-ms"));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_approval_id_stops_daemon_state() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("PATCH"))
        .and(matchers::path(format!("/api/sessions/{SESSION}/daemon-state")))
        .and(matchers::body_partial_json(json!({
            "status": "stopped",
            "stopped_reason": "invalid_request"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let uri = server.uri();
    let output = tokio::task::spawn_blocking(move || {
        let dir = tempfile::tempdir().unwrap();
        tetherd(dir.path())
            .env("TETHER_RELAY_URL", &uri)
            .env("TETHER_API_KEY", "test-key")
            .args([
                "await-approval",
                "--session-id",
                SESSION,
                "--approval-id",
                "appr.01HZX3",
                "--deadline-ms",
                "60000",
            ])
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    assert!(!output.status.success());
}
