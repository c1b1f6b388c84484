//! Integration tests for the `satya` binary.

#![cfg(test)]
#![allow(deprecated)]

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use tempfile::{TempDir, tempdir};

const CONTEXT: &str = "Mitochondria produce energy for the cell. The nucleus stores DNA.";

fn satya(models_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("satya").expect("satya bin");
    cmd.arg("--models-dir")
        .arg(models_dir)
        .env_remove("SATYA_CONFIG");
    cmd
}

/// Stock layout with both short-form model directories present and no
/// generative model.
fn short_form_models() -> TempDir {
    let root = tempdir().expect("tempdir");
    let qna = root.path().join("qna");
    fs::create_dir_all(&qna).expect("qna dir");
    fs::write(
        qna.join("config.json"),
        r#"{"architectures": ["DistilBertForQuestionAnswering"]}"#,
    )
    .expect("qna config");

    let hint = root.path().join("hint");
    fs::create_dir_all(&hint).expect("hint dir");
    fs::write(
        hint.join("config.json"),
        r#"{"architectures": ["T5ForConditionalGeneration"]}"#,
    )
    .expect("hint config");
    root
}

fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("valid json output")
}

#[test]
fn ask_without_models_returns_default_answer() {
    let empty = tempdir().expect("tempdir");

    let value = json_output(
        satya(empty.path())
            .args(["ask", "What do mitochondria produce?", "--context", CONTEXT])
            .arg("--json"),
    );

    assert_eq!(
        value["text"],
        "I'm having trouble processing your question. Please try again."
    );
    assert_eq!(value["outcome"]["answered_by"]["source"], "default");
    assert_eq!(value["outcome"]["fallback_triggered"], true);
}

#[test]
fn hints_without_models_always_returns_three() {
    let empty = tempdir().expect("tempdir");

    let value = json_output(satya(empty.path()).args(["hints", "Why is the sky blue?", "--json"]));

    let items = value["items"].as_array().expect("items array");
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|item| !item.as_str().unwrap_or("").is_empty()));
}

#[test]
fn ask_served_by_primary_tier() {
    let models = short_form_models();

    let value = json_output(
        satya(models.path())
            .args(["ask", "What do mitochondria produce?", "--context", CONTEXT])
            .arg("--json"),
    );

    assert!(
        value["text"]
            .as_str()
            .expect("text")
            .contains("Mitochondria produce energy"),
        "{value}"
    );
    assert_eq!(value["outcome"]["answered_by"]["source"], "backend");
    assert_eq!(value["outcome"]["answered_by"]["id"], "qna");
    assert_eq!(value["outcome"]["backend_mode"], "pipeline");
}

#[test]
fn ask_reads_context_file() {
    let models = short_form_models();
    let passage = models.path().join("passage.txt");
    fs::write(&passage, CONTEXT).expect("passage");

    satya(models.path())
        .args(["ask", "What do mitochondria produce?", "--context-file"])
        .arg(&passage)
        .assert()
        .success()
        .stdout(contains("Mitochondria produce energy"))
        .stdout(contains("Served by"));
}

#[test]
fn check_fails_when_a_backend_cannot_load() {
    let models = short_form_models();

    satya(models.path())
        .arg("check")
        .assert()
        .failure()
        .stdout(contains("phi2"))
        .stderr(contains("1 of 3 backends failed to load"));
}

#[test]
fn info_json_lists_configured_backends() {
    let empty = tempdir().expect("tempdir");

    let value = json_output(satya(empty.path()).args(["info", "--json"]));

    let backends = value["backends"].as_array().expect("backends array");
    let ids: Vec<&str> = backends.iter().filter_map(|b| b["id"].as_str()).collect();
    assert_eq!(ids, ["qna", "hint", "phi2"]);
    assert_eq!(value["backend"], "qna");
    assert_eq!(value["residency"], "concurrent");
}

#[test]
fn config_file_overrides_stock_layout() {
    let models = short_form_models();
    let config = models.path().join("satya.toml");
    fs::write(
        &config,
        format!(
            r#"
residency = "single_resident"

[[backends]]
id = "reader"
kind = "extractive"
tasks = ["answer"]
tier = "primary"
footprint_mb = 260
artifact_path = "{}"
"#,
            models.path().join("qna").display()
        ),
    )
    .expect("config");

    let value = json_output(
        satya(models.path())
            .arg("--config")
            .arg(&config)
            .args(["info", "--json"]),
    );

    assert_eq!(value["backend"], "reader");
    assert_eq!(value["residency"], "single_resident");
}

#[test]
fn unknown_answer_length_is_rejected() {
    let empty = tempdir().expect("tempdir");

    satya(empty.path())
        .args(["ask", "Q?", "--length", "enormous"])
        .assert()
        .failure();
}
