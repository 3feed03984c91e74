use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn mqa_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mqa"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(data_dir.join("eval")).unwrap();

    fs::write(
        root.join("messages.json"),
        r#"[
  {"id": "msg-1", "user_id": "u-1", "user_name": "Layla", "timestamp": "2024-05-01T10:00:00+02:00",
   "message": "Planning my trip to London in June, need a hotel near Hyde Park."},
  {"id": "msg-2", "user_id": "u-2", "user_name": "Vikram", "timestamp": "2024-05-02T09:30:00",
   "message": "Please book a car service for my BMW next Tuesday."},
  {"id": "msg-3", "user_id": "u-3", "user_name": "Amira", "timestamp": "2024-05-03T18:45:00Z",
   "message": "I have 2 restaurant reservations in Paris this weekend."}
]"#,
    )
    .unwrap();

    fs::write(
        data_dir.join("eval").join("gold.jsonl"),
        "{\"question\": \"When is Layla's trip to London?\", \"expected_answer\": \"June\"}\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{root}/data"
index_dir = "{root}/data/vectorstore"
reports_dir = "{root}/reports"

[source]
kind = "file"
path = "{root}/messages.json"

[embedding]
provider = "hash"
dims = 64

[generation]
provider = "disabled"

[verifier]
provider = "disabled"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("mqa.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mqa(config: &Path, args: &[&str]) -> Output {
    Command::new(mqa_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run mqa")
}

fn stdout_ok(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(
        output.status.success(),
        "mqa failed: stdout={} stderr={}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout
}

#[test]
fn test_fetch_preprocess_build_index() {
    let (tmp, config) = setup_test_env();

    let stdout = stdout_ok(&run_mqa(&config, &["fetch"]));
    assert!(stdout.contains("Fetched 3 messages from file source"));
    assert!(stdout.trim_end().ends_with("ok"));

    let stdout = stdout_ok(&run_mqa(&config, &["preprocess"]));
    assert!(stdout.contains("records: 3"));
    assert!(tmp
        .path()
        .join("data")
        .join("processed")
        .join("messages.json")
        .exists());

    let stdout = stdout_ok(&run_mqa(&config, &["build-index"]));
    assert!(stdout.contains("documents:       3"));
    assert!(stdout.contains("hash-64"));
    let index_dir = tmp.path().join("data").join("vectorstore");
    assert!(index_dir.join("manifest.json").exists());
    assert!(index_dir.join("sparse.json").exists());
    assert!(index_dir.join("dense.json").exists());

    // Second build reuses the persisted index.
    let stdout = stdout_ok(&run_mqa(&config, &["build-index"]));
    assert!(stdout.contains("documents:       3"));
}

#[test]
fn test_ask_cites_messages() {
    let (_tmp, config) = setup_test_env();

    let stdout = stdout_ok(&run_mqa(
        &config,
        &["ask", "When is Layla's trip to London?"],
    ));
    // Generation is disabled, so the degraded answer is returned with sources.
    assert!(stdout.contains("I found relevant information"));
    assert!(stdout.contains("[msg-1] Layla @ 2024-05-01 08:00"));
    assert!(stdout.contains("verifier error"));
}

#[test]
fn test_insights_and_evaluate_write_reports() {
    let (tmp, config) = setup_test_env();

    let stdout = stdout_ok(&run_mqa(&config, &["insights"]));
    assert!(stdout.contains("Most active members"));
    let report = fs::read_to_string(tmp.path().join("reports").join("insights.md")).unwrap();
    assert!(report.starts_with("# Data Insights"));

    let stdout = stdout_ok(&run_mqa(&config, &["evaluate"]));
    assert!(stdout.contains("Evaluated 1 examples"));
    let report: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(tmp.path().join("reports").join("evaluation.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(report["examples"].as_array().unwrap().len(), 1);
    assert_eq!(report["support_rate"], 1.0);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let output = run_mqa(&tmp.path().join("nope.toml"), &["ask", "hello"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read config file"));
}
