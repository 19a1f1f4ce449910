//! CLI smoke tests for girder.
//!
//! These verify that the commands run against a real on-disk project and
//! return appropriate exit codes.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// An on-disk test project.
struct TestProject {
  _temp: TempDir,
  root: PathBuf,
}

impl TestProject {
  /// A minimal project: a bootstrap and a buildfile declaring an fsdir
  /// chain.
  fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("prj");

    write(&root.join("build/bootstrap.build"), "project = hello\n");
    write(&root.join("buildfile"), "fsdir{out/a/}:\n");

    Self { _temp: temp, root }
  }

  fn cmd(&self) -> Command {
    let mut cmd = Command::cargo_bin("girder").unwrap();
    cmd.current_dir(&self.root);
    cmd
  }
}

fn write(p: &Path, content: &str) {
  std::fs::create_dir_all(p.parent().unwrap()).unwrap();
  std::fs::write(p, content).unwrap();
}

fn girder() -> Command {
  Command::cargo_bin("girder").unwrap()
}

#[test]
fn help_flag_works() {
  girder()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  girder()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("girder"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["update", "clean", "info"] {
    girder()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

#[test]
fn update_creates_directories() {
  let prj = TestProject::new();

  prj
    .cmd()
    .arg("update")
    .assert()
    .success()
    .stdout(predicate::str::contains("changed"));

  assert!(prj.root.join("out/a").is_dir());

  // A second update reports everything unchanged.
  prj
    .cmd()
    .arg("update")
    .assert()
    .success()
    .stdout(predicate::str::contains("0 changed"));
}

#[test]
fn clean_removes_directories() {
  let prj = TestProject::new();

  prj.cmd().arg("update").assert().success();
  assert!(prj.root.join("out/a").is_dir());

  prj.cmd().arg("clean").assert().success();
  assert!(!prj.root.join("out").exists());
}

#[test]
fn info_shows_roots() {
  let prj = TestProject::new();

  prj
    .cmd()
    .arg("info")
    .assert()
    .success()
    .stdout(predicate::str::contains("out root"))
    .stdout(predicate::str::contains("operations"))
    .stdout(predicate::str::contains("update"));
}

#[test]
fn update_outside_project_fails() {
  let temp = TempDir::new().unwrap();

  girder()
    .current_dir(temp.path())
    .arg("update")
    .assert()
    .failure()
    .stderr(predicate::str::contains("no project"));
}

#[test]
fn update_of_missing_file_fails() {
  let prj = TestProject::new();

  prj
    .cmd()
    .arg("update")
    .arg("file{nosuch.txt}")
    .assert()
    .failure()
    .code(1);
}

#[test]
fn explicit_target_argument() {
  let prj = TestProject::new();

  prj
    .cmd()
    .arg("update")
    .arg("fsdir{deep/er/}")
    .assert()
    .success();
  assert!(prj.root.join("deep/er").is_dir());
}

#[test]
fn config_variable_override_is_accepted() {
  let prj = TestProject::new();

  prj
    .cmd()
    .arg("update")
    .arg("config.hello.extras=true")
    .assert()
    .success();
}
