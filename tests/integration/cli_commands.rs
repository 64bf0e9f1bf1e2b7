#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn setup() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("left.csv"), "id,a\n1,10\n2,20\n3,30\n").expect("write left");
    fs::write(dir.path().join("right.csv"), "id,b\n1,100\n3,300\n4,400\n").expect("write right");
    dir
}

fn run_json(data_dir: &Path, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("dataslot")
        .env_remove("DATASLOT_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--data-dir")
        .arg(data_dir)
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn upload_query_and_clear() {
    let dir = setup();
    let data = dir.path().join("data");
    let left = dir.path().join("left.csv");
    let right = dir.path().join("right.csv");

    let uploaded = run_json(&data, &["upload", left.to_str().unwrap()]);
    assert_eq!(uploaded["display_name"], "left.csv");
    assert_eq!(uploaded["slot_count"], 1);
    let left_id = uploaded["dataset_id"].as_str().unwrap().to_string();
    run_json(&data, &["upload", right.to_str().unwrap()]);

    let current = run_json(&data, &["current"]);
    assert_eq!(current.as_array().unwrap().len(), 2);

    let chunk = run_json(&data, &["chunk", &left_id, "--n-rows", "2"]);
    assert_eq!(chunk["rows"], serde_json::json!([[1, 10], [2, 20]]));

    let grid = run_json(
        &data,
        &["sql", "SELECT t1.id, a, b FROM t1 JOIN t2 ON t1.id = t2.id ORDER BY t1.id"],
    );
    assert_eq!(grid["rows"], serde_json::json!([[1, 10, 100], [3, 30, 300]]));

    let steps = r#"[{"op":"source","table":"t2"},{"op":"limit","n":2}]"#;
    let grid = run_json(&data, &["ops", steps, "--max-rows", "1"]);
    assert_eq!(grid["truncated"], true);

    let cleared = run_json(&data, &["remove", "--all"]);
    assert_eq!(cleared["slot_count"], 0);
    assert!(run_json(&data, &["current"]).as_array().unwrap().is_empty());
}

#[test]
fn failures_exit_non_zero() {
    let dir = setup();
    let data = dir.path().join("data");

    cargo_bin_cmd!("dataslot")
        .env_remove("DATASLOT_CONFIG")
        .arg("--data-dir")
        .arg(&data)
        .args(["sql", "SELECT 1"])
        .assert()
        .failure();

    cargo_bin_cmd!("dataslot")
        .env_remove("DATASLOT_CONFIG")
        .arg("--data-dir")
        .arg(&data)
        .args(["remove", "0123456789abcdef"])
        .assert()
        .failure();
}
