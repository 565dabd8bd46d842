#![cfg(feature = "cli")]

use std::net::TcpListener;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn fabex() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_fabex"));
    command
        .env_remove("FABEX_ADDR")
        .env_remove("FABEX_PORT")
        .arg("--log-level")
        .arg("error");
    command
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("probe bind")
        .local_addr()
        .expect("probe addr")
        .port()
}

fn json_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("stdout line should be JSON"))
        .collect()
}

#[test]
fn demo_runs_both_roles() {
    let output = fabex()
        .args(["--format", "json", "demo"])
        .output()
        .expect("demo should run");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let reports = json_lines(&output);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["role"], "server");
    assert_eq!(reports[1]["role"], "client");
    for report in &reports {
        assert_eq!(report["mode"], "two-way");
        assert_eq!(report["received_elements"], 70);
    }
    assert!((reports[1]["received_value"].as_f64().unwrap() - 123.45).abs() < 1e-3);
}

#[test]
fn demo_one_way_with_small_messages() {
    let output = fabex()
        .args([
            "--format",
            "json",
            "demo",
            "--mode",
            "one-way",
            "--count",
            "100",
            "--max-msg-size",
            "64",
        ])
        .output()
        .expect("demo should run");

    assert!(output.status.success());
    let reports = json_lines(&output);
    let server = &reports[0];
    assert_eq!(server["received_elements"], 100);
    assert!(server["sent_value"].is_null());
    let array = server["transfers"]
        .as_array()
        .and_then(|transfers| transfers.first())
        .expect("server array transfer");
    assert_eq!(array["bytes"], 400);
    assert_eq!(array["chunks"], 7);
}

#[test]
fn server_and_client_processes_exchange() {
    let port = free_port().to_string();
    let server = fabex()
        .args(["--format", "json", "server", "--port", &port, "--bind", "127.0.0.1"])
        .args(["--request-timeout", "10s"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("server should start");

    let start = Instant::now();
    let client = loop {
        let output = fabex()
            .args(["--format", "json", "client", "-a", "127.0.0.1", "-p", &port])
            .output()
            .expect("client should run");
        if output.status.success() {
            break output;
        }
        assert_eq!(output.status.code(), Some(3), "only refused connects are retried");
        assert!(start.elapsed() < Duration::from_secs(5), "server never listened");
        thread::sleep(Duration::from_millis(50));
    };

    let server = server.wait_with_output().expect("server should exit");
    assert!(server.status.success());
    let received = json_lines(&client)[0]["received_value"]
        .as_f64()
        .expect("client received a value");
    assert!((received - 123.45).abs() < 1e-3);
    assert_eq!(json_lines(&server)[0]["received_elements"], 70);
}

#[test]
fn refused_connection_reports_operation_and_exit_code() {
    let port = free_port().to_string();
    let output = fabex()
        .args(["client", "-p", &port])
        .output()
        .expect("client should run");

    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Connection refused"), "stderr: {stderr}");
}

#[test]
fn server_request_timeout_returns_124() {
    let port = free_port().to_string();
    let output = fabex()
        .args(["server", "--port", &port, "--request-timeout", "100ms"])
        .output()
        .expect("server should run");

    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn unknown_option_is_usage_error() {
    let output = fabex()
        .args(["client", "--frobnicate"])
        .output()
        .expect("client should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn invalid_address_is_usage_error() {
    let output = fabex()
        .args(["client", "-a", "not-an-ip"])
        .output()
        .expect("client should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_prints_package_version() {
    let output = fabex().arg("version").output().expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("fabex "));
}
