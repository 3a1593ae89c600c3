#![allow(missing_docs)]

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn json_stdout(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

#[test]
fn simulate_reports_every_transaction() {
    let output = cargo_bin_cmd!("idb-sim")
        .env_remove("IDB_SIM_CONFIG")
        .args([
            "--format",
            "json",
            "simulate",
            "--preset",
            "ephemeral",
            "--databases",
            "2",
            "--clients",
            "2",
            "--transactions",
            "6",
            "--seed",
            "42",
            "--log",
            "warn",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json_stdout(&output);

    assert_eq!(report["seed"], 42);
    let committed = report["committed"].as_u64().expect("committed");
    let aborted = report["aborted"].as_u64().expect("aborted");
    assert_eq!(committed + aborted, 2 * 2 * 6);

    let records = report["records"].as_object().expect("records");
    assert!(records.contains_key("sim-0"));
    assert!(records.contains_key("sim-1"));

    let metrics = &report["metrics"];
    assert!(metrics["transactions_started"].as_u64().expect("started") >= 24);
    assert!(metrics["requests_admitted"].as_u64().expect("admitted") >= 2);
}

#[test]
fn simulate_prints_a_text_summary() {
    let output = cargo_bin_cmd!("idb-sim")
        .env_remove("IDB_SIM_CONFIG")
        .args([
            "simulate",
            "--preset",
            "durable",
            "--databases",
            "1",
            "--clients",
            "1",
            "--transactions",
            "3",
            "--log",
            "error",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Simulated 1 database(s) x 1 client(s)"));
    assert!(text.contains("sim-0="));
}

#[test]
fn simulate_rejects_zero_clients() {
    cargo_bin_cmd!("idb-sim")
        .args(["simulate", "--clients", "0"])
        .assert()
        .failure();
}

#[test]
fn config_init_then_show_round_trips() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("idb").join("config.toml");

    cargo_bin_cmd!("idb-sim")
        .arg("--config")
        .arg(&path)
        .args(["config", "init", "--preset", "durable"])
        .assert()
        .success();
    assert!(path.exists());

    // A second init must not clobber the file.
    cargo_bin_cmd!("idb-sim")
        .arg("--config")
        .arg(&path)
        .args(["config", "init"])
        .assert()
        .failure();

    let output = cargo_bin_cmd!("idb-sim")
        .env("IDB_SIM_CONFIG", &path)
        .args(["--format", "json", "config", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let config = json_stdout(&output);
    assert_eq!(config["quota"]["origin_limit_bytes"], 64 * 1024 * 1024);
    assert_eq!(config["storage"]["simultaneous_read_write"], false);
}
