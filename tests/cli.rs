use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use serde_json::{Value, json};
use tempfile::tempdir;

fn pype() -> Command {
    Command::cargo_bin("pype").expect("binary")
}

fn quickstart() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("recipes/quickstart.yaml")
}

#[test]
fn list_operators_prints_builtin_components() {
    let output = pype().arg("list-operators").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("- standard_scaler"));
    assert!(stdout.contains("- mean"));
}

#[test]
fn recipe_new_writes_a_valid_preset() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("baseline.yaml");
    pype()
        .args(["recipe", "new", "--preset", "baseline", "--output"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.is_file());

    pype().arg("validate").arg(&path).assert().success();
    pype()
        .args(["recipe", "new", "--preset", "nonsense", "--output"])
        .arg(temp.path().join("nonsense.yaml"))
        .assert()
        .failure();
}

#[test]
fn run_predict_and_verify_a_quickstart_experiment() {
    let temp = tempdir().unwrap();
    let folder = temp.path().join("run");

    let output = pype()
        .arg("run")
        .arg(quickstart())
        .args(["--param", "model__a=1"])
        .arg("--output")
        .arg(&folder)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let metrics: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(metrics["test"]["mse"].is_number());

    let request = temp.path().join("request.json");
    fs::write(&request, r#"{"x": [2]}"#).unwrap();
    let response = temp.path().join("response.json");
    pype()
        .arg("predict")
        .arg(&folder)
        .arg("--input")
        .arg(&request)
        .arg("--output")
        .arg(&response)
        .assert()
        .success();
    let response: Value = serde_json::from_str(&fs::read_to_string(&response).unwrap()).unwrap();
    assert_eq!(response, json!({"y": [5.5]}));

    pype()
        .arg("digest")
        .arg(&folder)
        .arg("--verify")
        .assert()
        .success();
    fs::write(folder.join("metrics.json"), "{}").unwrap();
    pype()
        .arg("digest")
        .arg(&folder)
        .arg("--verify")
        .assert()
        .failure();
}

#[test]
fn predict_rejects_requests_outside_the_schema() {
    let temp = tempdir().unwrap();
    let folder = temp.path().join("run");
    pype()
        .arg("run")
        .arg(quickstart())
        .arg("--output")
        .arg(&folder)
        .assert()
        .success();

    let request = temp.path().join("bad.json");
    fs::write(&request, r#"{"x": ["not", "numbers"]}"#).unwrap();
    pype()
        .arg("predict")
        .arg(&folder)
        .arg("--input")
        .arg(&request)
        .assert()
        .failure();
}

#[test]
fn dry_run_writes_nothing() {
    let temp = tempdir().unwrap();
    let folder = temp.path().join("run");
    pype()
        .arg("run")
        .arg(quickstart())
        .arg("--dry-run")
        .arg("--output")
        .arg(&folder)
        .assert()
        .success();
    assert!(!folder.exists());
}

#[test]
fn serve_rejects_malformed_tracking_entries() {
    let temp = tempdir().unwrap();
    let output = pype()
        .arg("serve")
        .arg(temp.path())
        .args(["--track", "predictions.jsonl"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("name=path"), "{stderr}");
}
