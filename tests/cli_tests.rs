//! CLI tests for the `gpuowl` binary.
//!
//! These exercise the `clap` surface with `assert_cmd`, which spawns the
//! compiled binary and asserts on exit status and output. None of them need
//! a GPU: they cover help text and argument validation only; everything
//! that touches a device is tested through the engine seam instead.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test cli_tests
//! ```

use assert_cmd::Command;
use predicates::prelude::*;

fn gpuowl() -> Command {
    Command::cargo_bin("gpuowl").expect("binary builds")
}

#[test]
fn help_lists_core_flags() {
    gpuowl()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--device")
                .and(predicate::str::contains("--time-kernels"))
                .and(predicate::str::contains("--tail"))
                .and(predicate::str::contains("--worktodo"))
                .and(predicate::str::contains("--list-devices")),
        );
}

#[test]
fn help_documents_tail_strategy() {
    gpuowl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Tail strategy"));
}

#[test]
fn rejects_unknown_tail_strategy() {
    gpuowl()
        .args(["--tail", "bogus", "--list-devices"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn rejects_unknown_flag() {
    gpuowl()
        .arg("--no-such-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}

#[test]
fn rejects_non_numeric_device_index() {
    gpuowl()
        .args(["--device", "gfx906"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
