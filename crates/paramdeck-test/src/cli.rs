//! CLI regression tests for the `paramdeck` binary.
//!
//! These run the binary as a subprocess to pin flag names, exit codes and
//! output formats.
//!
//! Run with: `cargo test -p paramdeck-test`
//! Requires the `paramdeck` binary to be built first (`cargo build -p paramdeck`).

use assert_cmd::assert::{Assert, OutputAssertExt};
use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

use crate::backend::{TestBackend, SESSION_TOKEN};
use crate::evaluator::TestEvaluator;
use crate::fixtures::{dropdown_parameter, number_parameter};
use paramdeck_lib::protocol::PreviewParameter;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The `paramdeck` binary with no deployment settings inherited from the
/// environment.
fn paramdeck() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("paramdeck")
        .expect("paramdeck binary not found, run `cargo build -p paramdeck` first");
    cmd.env_remove("PARAMDECK_URL")
        .env_remove("PARAMDECK_SESSION_TOKEN")
        .env_remove("PARAMDECK_LOG_FORMAT");
    cmd
}

fn parameters() -> Vec<PreviewParameter> {
    let mut region = dropdown_parameter("region", "us", &["us", "eu", "ap"]);
    region.order = 1;
    let mut cpu = number_parameter("cpu", 2);
    cpu.order = 2;
    vec![region, cpu]
}

/// Global flags pointing the binary at the harnesses.
fn deployment_args(backend: &TestBackend, evaluator: &TestEvaluator) -> Vec<String> {
    vec![
        "--url".to_string(),
        backend.uri(),
        "--websocket-url".to_string(),
        evaluator.ws_url(),
        "--token".to_string(),
        SESSION_TOKEN.to_string(),
    ]
}

/// Run `cmd` off the runtime so the mock servers keep serving.
async fn run(mut cmd: Command) -> Assert {
    tokio::task::spawn_blocking(move || cmd.output())
        .await
        .expect("command thread panicked")
        .expect("failed to run paramdeck")
        .assert()
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

#[test]
fn help_lists_commands() {
    paramdeck()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("preview"))
        .stdout(contains("evaluate"))
        .stdout(contains("create"));
}

#[test]
fn create_help_shows_flags() {
    paramdeck()
        .args(["create", "--help"])
        .assert()
        .success()
        .stdout(contains("--template"))
        .stdout(contains("--param"))
        .stdout(contains("--values-file"))
        .stdout(contains("--auto"))
        .stdout(contains("--duplicate"));
}

#[test]
fn missing_url_exits_two() {
    paramdeck()
        .args(["preview", "--template", "docker"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("no deployment url"));
}

#[test]
fn missing_template_is_rejected_by_clap() {
    paramdeck()
        .args(["--url", "http://127.0.0.1:1", "preview"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("--template"));
}

#[test]
fn unknown_output_format_exits_two() {
    paramdeck()
        .args(["--output", "yaml", "preview", "--template", "docker"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("unknown output format"));
}

#[test]
fn malformed_param_exits_two() {
    paramdeck()
        .args(["--url", "http://127.0.0.1:1", "create", "--template", "docker", "-p", "region"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("expected name=value"));
}

#[test]
fn missing_values_file_exits_two() {
    let dir = TempDir::new().unwrap();
    paramdeck()
        .args(["--url", "http://127.0.0.1:1", "create", "--template", "docker", "--values-file"])
        .arg(dir.path().join("missing.yaml"))
        .assert()
        .failure()
        .code(2)
        .stderr(contains("invalid values file"));
}

#[test]
fn unreachable_deployment_exits_one() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    paramdeck()
        .args(["--url", &format!("http://127.0.0.1:{port}"), "preview", "--template", "docker"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("HTTP error"));
}

// ---------------------------------------------------------------------------
// Against the harnesses
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn preview_prints_evaluated_parameters() {
    let backend = TestBackend::start().await;
    let evaluator = TestEvaluator::start(parameters()).await.unwrap();

    let mut cmd = paramdeck();
    cmd.args(deployment_args(&backend, &evaluator))
        .args(["preview", "--template", "docker", "--set", "region=eu"]);

    run(cmd)
        .await
        .success()
        .stdout(contains("region"))
        .stdout(contains("eu"))
        .stdout(contains("number"));
}

#[tokio::test(flavor = "multi_thread")]
async fn preview_json_output() {
    let backend = TestBackend::start().await;
    let evaluator = TestEvaluator::start(parameters()).await.unwrap();

    let mut cmd = paramdeck();
    cmd.args(deployment_args(&backend, &evaluator))
        .args(["--output", "json", "preview", "--template", "docker", "-p", "cpu=6"]);

    let assert = run(cmd).await.success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["inputs"]["cpu"], "6");
    assert_eq!(json["parameters"][0]["name"], "region");
}

#[tokio::test(flavor = "multi_thread")]
async fn create_with_values_file() {
    let backend = TestBackend::start().await;
    backend.accept_creation(&backend.user).await;
    let evaluator = TestEvaluator::start(parameters()).await.unwrap();

    let dir = TempDir::new().unwrap();
    let values = dir.path().join("values.yaml");
    std::fs::write(&values, "region: ap\ncpu: 4\n").unwrap();

    let mut cmd = paramdeck();
    cmd.args(deployment_args(&backend, &evaluator))
        .args(["create", "--template", "docker", "--name", "dev-box", "--values-file"])
        .arg(&values);

    run(cmd)
        .await
        .success()
        .stdout(contains("created workspace alice/dev-box"));

    let requests = backend.creation_requests().await;
    assert_eq!(requests.len(), 1);
    let region = requests[0]
        .rich_parameter_values
        .iter()
        .find(|p| p.name == "region")
        .unwrap();
    assert_eq!(region.value, "ap");
}

#[tokio::test(flavor = "multi_thread")]
async fn create_failure_exits_one() {
    let backend = TestBackend::start().await;
    backend
        .reject_creation(&backend.user, 409, "Workspace \"dev-box\" already exists.", 1)
        .await;
    let evaluator = TestEvaluator::start(parameters()).await.unwrap();

    let mut cmd = paramdeck();
    cmd.args(deployment_args(&backend, &evaluator))
        .args(["create", "--template", "docker", "--name", "dev-box"]);

    run(cmd)
        .await
        .failure()
        .code(1)
        .stderr(contains("already exists"));
}
