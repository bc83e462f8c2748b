use assert_cmd::Command;
use tempfile::NamedTempFile;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().expect("tempfile");
    std::io::Write::write_all(&mut f, contents.as_bytes()).expect("write");
    f
}

#[test]
fn run_command_returns_0_when_every_step_passes() {
    let book = r#"
desc: smoke
steps:
  - exec:
      command: echo ok
  - test: steps[0].exit_code == 0
"#;
    let f = write_temp(book);

    let bin = assert_cmd::cargo::cargo_bin!("opsbook");
    Command::new(bin)
        .args(["run", f.path().to_string_lossy().as_ref()])
        .assert()
        .success();
}

#[test]
fn run_command_returns_1_on_a_failing_test_step() {
    let book = r#"
desc: failing
steps:
  - exec:
      command: echo ok
  - test: steps[0].exit_code == 99
"#;
    let f = write_temp(book);

    let bin = assert_cmd::cargo::cargo_bin!("opsbook");
    Command::new(bin)
        .args(["run", f.path().to_string_lossy().as_ref()])
        .assert()
        .code(1); // RUN_FAILURE
}

#[test]
fn list_command_prints_selected_books() {
    let book = "desc: listed\nsteps:\n  - exec:\n      command: 'true'\n";
    let f = write_temp(book);

    let bin = assert_cmd::cargo::cargo_bin!("opsbook");
    let assert = Command::new(bin)
        .args(["list", f.path().to_string_lossy().as_ref()])
        .assert()
        .success();
    let out = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(out.contains("listed"), "{out}");
}
