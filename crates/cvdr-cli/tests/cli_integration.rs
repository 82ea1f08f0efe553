//! CLI integration tests
//!
//! Tests the cvdr CLI using assert_cmd.

use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cvdr() -> Command {
    Command::cargo_bin("cvdr").expect("Failed to locate cvdr binary")
}

/// Config file whose control directory lives inside `dir`
fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    let control = dir.join("connections");
    std::fs::write(
        &path,
        format!(
            "service_url = \"http://127.0.0.1:1\"\nconnection_control_dir = {:?}\n",
            control.display().to_string()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_cli_help() {
    cvdr()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Remote debug tunnels"))
        .stdout(predicate::str::contains("connect"))
        .stdout(predicate::str::contains("proxy_agent").not());
}

#[test]
fn test_cli_version() {
    cvdr()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cvdr"));
}

#[test]
fn test_cli_unknown_command() {
    cvdr()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_connect_requires_devices() {
    cvdr().args(["connect", "--host", "host-1"]).assert().failure();
}

#[test]
fn test_connect_without_host() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["connect", "dev-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("host for devices"));
}

#[test]
fn test_connect_rejects_http_proxy() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["--proxy", "http://127.0.0.1:3128"])
        .args(["connect", "--host", "host-1", "dev-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("socks5"));
}

#[test]
fn test_disconnect_ids_without_host() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["disconnect", "dev-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("host for devices"));
}

#[test]
fn test_disconnect_without_connections() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["disconnect", "--no-adb"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No connections found"));
}

#[test]
fn test_connections_empty() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    cvdr()
        .arg("--config")
        .arg(&config)
        .arg("connections")
        .assert()
        .success()
        .stdout(predicate::str::contains("No connections"));
}

#[test]
fn test_config_get() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["config", "get", "base_control_port"])
        .assert()
        .success()
        .stdout(predicate::str::diff("5555\n"));

    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["config", "get", "service_url"])
        .assert()
        .success()
        .stdout(predicate::str::contains("http://127.0.0.1:1"));

    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["config", "get", "no_such_key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown config key"));
}

#[test]
fn test_config_path() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    cvdr()
        .arg("--config")
        .arg(&config)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_missing_explicit_config() {
    let dir = TempDir::new().unwrap();
    cvdr()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_proxy_agent_fails_before_report() {
    let dir = TempDir::new().unwrap();
    cvdr()
        .args(["proxy_agent", "dev-1", "--host", "host-1"])
        .args(["--service-url", "http://127.0.0.1:1/v1"])
        .arg("--log-file")
        .arg(dir.path().join("agent.log"))
        .arg("--control-socket")
        .arg(dir.path().join("dev-1.sock"))
        .args(["--target", "127.0.0.1:1"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());

    assert!(dir.path().join("agent.log").exists());
    assert!(!dir.path().join("dev-1.sock").exists());
}

#[test]
fn test_proxy_agent_reports_and_stops_on_sigterm() {
    let device = TcpListener::bind("127.0.0.1:0").unwrap();
    let target = device.local_addr().unwrap().to_string();
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("dev-1.sock");

    let mut agent = std::process::Command::new(assert_cmd::cargo::cargo_bin("cvdr"))
        .args(["proxy_agent", "dev-1", "--host", "host-1"])
        .args(["--service-url", "http://127.0.0.1:1/v1"])
        .arg("--log-file")
        .arg(dir.path().join("agent.log"))
        .arg("--control-socket")
        .arg(&socket)
        .args(["--base-port", "21555", "--target", &target])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap();

    let mut line = String::new();
    BufReader::new(agent.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    let report: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(report["control_state"], "connected");
    assert!(report["control_port"].as_u64().unwrap() >= 21555);
    assert!(socket.exists());

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(agent.id().to_string())
        .status()
        .unwrap();
    assert!(status.success());

    let exit = agent.wait().unwrap();
    assert!(exit.success());
    assert!(!socket.exists());
}
