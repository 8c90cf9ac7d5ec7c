use assert_cmd::Command;
use std::fs;
use tempfile::TempDir;

fn config_file(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("k8s.toml");
    fs::write(
        &path,
        r#"
namespace = "demo"

[readiness]
poll_interval_ms = 20
timeout_secs = 5
"#,
    )
    .unwrap();
    path
}

fn b00t_k8s() -> Command {
    let mut cmd = Command::cargo_bin("b00t-k8s").unwrap();
    cmd.env_remove("B00T_K8S_NAMESPACE");
    cmd
}

#[test]
fn test_simulated_up_with_teardown() {
    let dir = TempDir::new().unwrap();
    let output = b00t_k8s()
        .arg("--config")
        .arg(config_file(&dir))
        .args(["--simulate", "up", "--name", "demo", "--image", "app:v1", "--teardown"])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("b00t-agent-demo"));
    assert!(stdout.contains("Ready"));
    assert!(stdout.contains("Terminated"));
}

#[test]
fn test_simulated_up_json_output() {
    let dir = TempDir::new().unwrap();
    let output = b00t_k8s()
        .arg("--config")
        .arg(config_file(&dir))
        .args([
            "--simulate", "up", "--name", "demo", "--image", "app:v1",
            "--autoscale-min", "1", "--autoscale-max", "3", "--autoscale-target", "70",
            "--retain", "--teardown", "--format", "json",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"state\": \"Ready\""));
    assert!(stdout.contains("\"max_replicas\": 3"));
    assert!(stdout.contains("Detached"));
}

#[test]
fn test_missing_image_is_rejected() {
    let dir = TempDir::new().unwrap();
    let output = b00t_k8s()
        .arg("--config")
        .arg(config_file(&dir))
        .args(["--simulate", "up", "--name", "demo"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("image"));
}

#[test]
fn test_invalid_namespace_is_rejected() {
    let dir = TempDir::new().unwrap();
    let output = b00t_k8s()
        .arg("--config")
        .arg(config_file(&dir))
        .args(["--simulate", "--namespace", "Bad_NS", "status", "--name", "demo"])
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_detect_runs_without_cluster() {
    let dir = TempDir::new().unwrap();
    b00t_k8s()
        .arg("--config")
        .arg(config_file(&dir))
        .env("HOME", dir.path())
        .env_remove("KUBECONFIG")
        .env_remove("KUBERNETES_SERVICE_HOST")
        .arg("detect")
        .assert()
        .success();
}

#[test]
fn test_existing_workload_commands_need_no_image() {
    let dir = TempDir::new().unwrap();
    let empty = dir.path().join("empty.toml");
    fs::write(&empty, "").unwrap();

    let output = b00t_k8s()
        .arg("--config")
        .arg(&empty)
        .args(["--simulate", "down", "--name", "demo"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("nothing to release"));

    let output = b00t_k8s()
        .arg("--config")
        .arg(&empty)
        .args(["--simulate", "status", "--name", "demo", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(!String::from_utf8_lossy(&output.stderr).contains("image is required"));
}
