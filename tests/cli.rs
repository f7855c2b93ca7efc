//! End-to-end checks for the CLI front-end's error-path exit codes
//! (spec.md §6 "Exit codes", §7).

use assert_cmd::Command;

#[test]
fn nonexistent_path_exits_nonzero() {
    let mut cmd = Command::cargo_bin("loader").unwrap();
    cmd.arg("/nonexistent/path/does-not-exist");
    cmd.assert().failure();
}

#[test]
fn non_elf_file_is_a_parse_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-an-elf");
    std::fs::write(&path, b"not an executable image").unwrap();

    let mut cmd = Command::cargo_bin("loader").unwrap();
    cmd.arg(&path);
    cmd.assert().failure();
}
