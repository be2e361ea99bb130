use std::process::Command;

fn harness() -> Command {
    Command::new(env!("CARGO_BIN_EXE_plugin-harness"))
}

#[test]
fn test_harness_version() {
    let output = harness().arg("--version").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0.1.0"));
}

#[test]
fn test_harness_help() {
    let output = harness().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("inspect"));
}

#[test]
fn test_run_missing_library_fails() {
    let output = harness()
        .args(["run", "--library", "/nonexistent/libdummy.so"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load library"), "{stderr}");
}

#[test]
fn test_run_bad_config_file_fails() {
    let output = harness()
        .args([
            "run",
            "--library",
            "/nonexistent/libdummy.so",
            "--config",
            "/nonexistent/run.toml",
        ])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read config file"), "{stderr}");
}
