//! End-to-end CLI tests for the manuscript-downloader binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::{PAGE_BYTES, page_body, zip_entries};

/// Command isolated from the user's config and working directory.
fn cli(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("manuscript-downloader").expect("binary built");
    cmd.env("XDG_CONFIG_HOME", home.join("config"))
        .env("HOME", home)
        .env_remove("RUST_LOG")
        .arg("--state-dir")
        .arg(home.join("state"));
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("manuscript-downloader").expect("binary built");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Download multi-page manuscripts"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_version_flag() {
    let mut cmd = Command::cargo_bin("manuscript-downloader").expect("binary built");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("manuscript-downloader"));
}

#[test]
fn test_missing_subcommand_is_an_error() {
    let mut cmd = Command::cargo_bin("manuscript-downloader").expect("binary built");
    cmd.assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_out_of_range_concurrency_is_rejected() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path())
        .args(["run", "--concurrency", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

#[test]
fn test_submit_then_list() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path())
        .args(["submit", "https://lib.example/ms/1/manifest.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("queued #1 https://lib.example/ms/1/manifest.json"));

    cli(home.path())
        .args(["submit", "https://lib.example/ms/1/manifest.json#top"])
        .assert()
        .success()
        .stdout(predicate::str::contains("queued #1"));

    cli(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("#1"))
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("1 item(s)"));
}

#[test]
fn test_submit_with_page_range_is_listed() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path())
        .args(["submit", "--pages", "3-10", "https://lib.example/ms/2/manifest.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("queued #1"))
        .stdout(predicate::str::contains("(pages 3-10)"));

    cli(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("[pages 3-10]"));

    cli(home.path())
        .args(["submit", "--pages", "0-4", "https://lib.example/ms/2/manifest.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("page numbers start at 1"));
}

#[test]
fn test_pause_and_resume_item() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path())
        .args(["submit", "https://lib.example/ms/3/manifest.json"])
        .assert()
        .success();

    cli(home.path())
        .args(["pause", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("paused #1"));
    cli(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("paused"));

    cli(home.path())
        .args(["pause", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to pause item #1"));

    cli(home.path())
        .args(["resume", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("resumed 1 item(s)"));
    cli(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"));
}

#[test]
fn test_clear_cache_on_empty_state() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path())
        .args(["clear", "--cache"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cleared 0 cached manifest(s)"));
}

#[test]
fn test_list_empty_queue() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue is empty."));
}

#[test]
fn test_retry_unknown_item_fails() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path())
        .args(["retry", "99"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to retry item #99"));
}

#[test]
fn test_clear_requires_a_selection() {
    let home = TempDir::new().expect("temp dir");
    cli(home.path()).arg("clear").assert().failure();
}

#[test]
fn test_invalid_config_file_is_reported() {
    let home = TempDir::new().expect("temp dir");
    let config = home.path().join("bad.toml");
    std::fs::write(&config, "retry_limit = 99\n").expect("write config");
    cli(home.path())
        .arg("--config")
        .arg(&config)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_downloads_and_assembles_manifest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ms/42/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "displayName": "Gradual",
            "library": "Example",
            "pages": [
                {"url": "page/0.jpg", "label": "1r"},
                {"url": "page/1.jpg", "label": "1v"}
            ]
        })))
        .mount(&server)
        .await;
    for index in 0..2 {
        Mock::given(method("GET"))
            .and(path(format!("/ms/42/page/{index}.jpg")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(page_body(index)),
            )
            .mount(&server)
            .await;
    }

    let home = TempDir::new().expect("temp dir");
    let out = home.path().join("out");
    let manifest_url = format!("{}/ms/42/manifest.json", server.uri());

    let submit = cli(home.path()).args(["submit", &manifest_url]).ok();
    assert!(submit.is_ok(), "submit failed: {submit:?}");

    let mut run = cli(home.path());
    run.arg("run").arg("--output-dir").arg(&out);
    let output = tokio::task::spawn_blocking(move || run.output())
        .await
        .expect("join")
        .expect("run command");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "run failed: {stdout}");
    assert!(stdout.contains("Completed 1 item(s), failed 0; 2 page(s)"), "{stdout}");

    let entries = zip_entries(&out.join("Gradual.zip"));
    let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["0001_1r.jpg", "0002_1v.jpg"]);
    assert_eq!(entries[1].1.len(), PAGE_BYTES);

    cli(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("Gradual.zip"));
}
