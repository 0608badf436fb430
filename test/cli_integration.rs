//! CLI Integration Tests for dlb
//!
//! Runs the `dlb` binary end to end against the probe library built by
//! build.rs.

use assert_cmd::Command;
use predicates::prelude::*;

/// Path of the probe library, or skip the test when it was not built.
macro_rules! probe_or_skip {
    () => {
        match option_env!("DLBRIDGE_PROBE_LIB") {
            Some(path) => path,
            None => {
                eprintln!("skipping: probe library was not built");
                return;
            }
        }
    };
}

/// `dlb` running in an empty directory, so no stray dlbridge.toml is picked up.
fn dlb(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("dlb").unwrap();
    cmd.current_dir(dir.path()).env_remove("RUST_LOG");
    cmd
}

// ============================================================================
// call
// ============================================================================

#[test]
fn test_call_prints_result() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", probe, "i32 double_me(i32)", "21"])
        .assert()
        .success()
        .stdout("42\n");
}

#[test]
fn test_call_negative_and_repeat() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", "--repeat", "3", probe, "i32 double_me(i32)", "-4"])
        .assert()
        .success()
        .stdout("-8\n-8\n-8\n");
}

#[test]
fn test_call_void_prints_completion_marker() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", probe, "void process()"])
        .assert()
        .success()
        .stdout("()\n");
}

#[test]
fn test_call_json() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    let output = dlb(&dir)
        .args(["call", "--json", probe, "u64 probe_strlen(cstr)", "hello"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["signature"], "u64 probe_strlen(cstr)");
    assert_eq!(value["results"][0], 5);
}

#[test]
fn test_call_missing_library() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("libnothing.so");

    dlb(&dir)
        .args(["call", missing.to_str().unwrap(), "void process()"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("library not found"));
}

#[test]
fn test_call_misspelled_symbol() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", probe, "void proces()"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("symbol 'proces' not found"));
}

#[test]
fn test_call_rejects_bad_argument() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", probe, "i8 probe_negate8(i8)", "300"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("out of range"));
}

#[test]
fn test_timeout_requires_isolate() {
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", "--timeout-ms", "10", "libm.so.6", "f64 cos(f64)", "0"])
        .assert()
        .failure()
        .code(2);
}

// ============================================================================
// --isolate
// ============================================================================

#[test]
fn test_isolated_call_succeeds() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", "--isolate", probe, "i32 double_me(i32)", "-5"])
        .assert()
        .success()
        .stdout("-10\n");
}

#[cfg(unix)]
#[test]
fn test_isolated_abort_reports_signal() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["call", "--isolate", probe, "void probe_abort()"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("terminated by signal"));
}

// ============================================================================
// check
// ============================================================================

#[test]
fn test_check_symbols() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();

    dlb(&dir)
        .args(["check", probe, "double_me", "process"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok       double_me"));

    dlb(&dir)
        .args(["check", probe, "double_me", "proces"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("missing  proces"));
}

// ============================================================================
// run / list with a config file
// ============================================================================

fn write_config(dir: &tempfile::TempDir, probe: &str) {
    let config = format!(
        r#"
[[libraries]]
name = "probe"
path = "{}"

[[libraries.functions]]
signature = "i32 double_me(i32)"
description = "Double an integer"

[[libraries.functions]]
signature = "void process()"
"#,
        probe
    );
    std::fs::write(dir.path().join("dlbridge.toml"), config).unwrap();
}

#[test]
fn test_run_declared_function() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    write_config(&dir, probe);

    dlb(&dir)
        .args(["run", "probe:double_me", "7"])
        .assert()
        .success()
        .stdout("14\n");

    dlb(&dir)
        .args(["run", "probe:nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not declared"));
}

#[test]
fn test_run_with_explicit_config() {
    let probe = probe_or_skip!();
    let config_dir = tempfile::tempdir().unwrap();
    write_config(&config_dir, probe);
    let work_dir = tempfile::tempdir().unwrap();
    let config_path = config_dir.path().join("dlbridge.toml");

    dlb(&work_dir)
        .args(["--config", config_path.to_str().unwrap(), "run", "--json", "probe:double_me", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"result\": 4"));
}

#[test]
fn test_list() {
    let probe = probe_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    write_config(&dir, probe);

    dlb(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("probe"))
        .stdout(predicate::str::contains("i32 double_me(i32)"))
        .stdout(predicate::str::contains("Double an integer"));
}

#[test]
fn test_list_without_config() {
    let dir = tempfile::tempdir().unwrap();
    // A dlbridge.toml above the temp dir would be picked up instead
    if dir.path().ancestors().skip(1).any(|p| p.join("dlbridge.toml").exists()) {
        return;
    }

    dlb(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout("No libraries declared\n");
}
