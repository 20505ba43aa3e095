use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

fn write_workflow(yaml: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

fn run_validate(paths: &[&std::path::Path]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_orc"))
        .arg("validate")
        .args(paths)
        .output()
        .expect("failed to run orc binary")
}

#[test]
fn valid_linear_workflow_exits_zero() {
    let file = write_workflow(
        r#"
name: book
stages:
  - name: outline
    agents:
      - [writer, gpt-writer]
  - name: draft
    depends_on: [outline]
    agents:
      - [writer, gpt-writer]
"#,
    );

    let output = run_validate(&[file.path()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Valid"));
}

#[test]
fn cyclic_workflow_exits_nonzero() {
    let file = write_workflow(
        r#"
name: broken
stages:
  - name: a
    depends_on: [b]
    agents:
      - [writer, gpt-writer]
  - name: b
    depends_on: [a]
    agents:
      - [writer, gpt-writer]
"#,
    );

    let output = run_validate(&[file.path()]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Invalid"));
    assert!(stdout.contains("circular dependency"));
}

#[test]
fn malformed_yaml_reports_schema_error() {
    let file = write_workflow("name: [this is not a valid workflow\n");

    let output = run_validate(&[file.path()]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("schema error"));
}

#[test]
fn multiple_files_are_each_reported() {
    let good = write_workflow(
        r#"
name: good
stages:
  - name: a
    agents:
      - [writer, gpt-writer]
"#,
    );
    let bad = write_workflow(
        r#"
name: bad
stages:
  - name: a
    depends_on: [ghost]
    agents:
      - [writer, gpt-writer]
"#,
    );

    let output = run_validate(&[good.path(), bad.path()]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Valid"));
    assert!(stdout.contains("Invalid"));
}
