//! Integration tests for the curriculum CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use curriculum_rs::dataset::{FilterArtifacts, ImageDataset};

const SIDE: usize = 4;
const CLASSES: usize = 3;

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("curriculum").expect("Failed to find curriculum binary");
    cmd.args(args);
    cmd.env("CURRICULUM_FORCE_CPU", "1");
    cmd
}

fn create_test_config(dir: &Path, content: &str) -> PathBuf {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

/// Writes train/test/filter files for `n` training samples and returns a
/// config pointing at them.
fn write_fixture(dir: &Path, n: usize) -> PathBuf {
    let images = |count: usize| (0..count * SIDE * SIDE).map(|i| (i % 5) as f32 / 5.0).collect();
    let labels = |count: usize| (0..count).map(|i| (i % CLASSES) as i64).collect();

    ImageDataset::new(images(n), labels(n), (1, SIDE, SIDE))
        .unwrap()
        .save(dir.join("train.safetensors"))
        .unwrap();
    ImageDataset::new(images(6), labels(6), (1, SIDE, SIDE))
        .unwrap()
        .save(dir.join("test.safetensors"))
        .unwrap();
    FilterArtifacts {
        filter_mask: (0..n).map(|i| i % 2 == 0).collect(),
        idx_sorted: (0..n).collect(),
        noise_or_not: Some(vec![true; n]),
    }
    .save(dir.join("filter.safetensors"))
    .unwrap();

    let yaml = format!(
        r#"
dataset:
  train_path: "{dir}/train.safetensors"
  test_path: "{dir}/test.safetensors"
  filter_path: "{dir}/filter.safetensors"
model:
  arch: mlp
  num_classes: {CLASSES}
  channels: 1
  height: {SIDE}
  width: {SIDE}
  hidden: 8
  dropout: 0.0
stage:
  n_epoch3: 3
  batch_size: 4
  num_workers: 2
  curriculum: true
  progress: false
correction:
  batch_size: 4
  num_workers: 0
fname: "{dir}/out"
time_now: "cli"
save_model: true
"#,
        dir = dir.display()
    );
    create_test_config(dir, &yaml)
}

#[test]
fn test_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("correct"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_init_then_validate() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("generated.yaml");
    let output = output.to_str().unwrap();

    run_cli(&["init", output, "--preset", "cifar100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written to"));

    let content = fs::read_to_string(output).unwrap();
    assert!(content.contains("num_classes: 100"));

    run_cli(&["validate", output])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_init_unknown_preset() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("config.yaml");
    run_cli(&["init", output.to_str().unwrap(), "--preset", "imagenet"])
        .assert()
        .failure();
    assert!(!output.exists());
}

#[test]
fn test_validate_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"]).assert().failure();
}

#[test]
fn test_validate_invalid_yaml() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path(), "dataset: [not, a, mapping");
    run_cli(&["validate", config.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_validate_rejects_single_epoch_budget() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(
        temp_dir.path(),
        r#"
dataset:
  train_path: "train.safetensors"
  test_path: "test.safetensors"
  filter_path: "filter.safetensors"
stage:
  n_epoch3: 1
"#,
    );
    run_cli(&["validate", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("n_epoch3"));
}

#[test]
fn test_train_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_fixture(temp_dir.path(), 12);

    run_cli(&["train", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("----------- Start Third Stage -----------"))
        .stdout(predicate::str::contains("Stage 3 - epoch:1 "))
        .stdout(predicate::str::contains("Stage 3 - epoch:2 "))
        .stdout(predicate::str::contains("Stage 3 - epoch:3 ").not())
        .stdout(predicate::str::contains("** stage 3 max test accuracy:"))
        .stdout(predicate::str::contains("acc_curr_True_cli.xlsx successfully"));

    let out = temp_dir.path().join("out");
    assert!(out.join("acc_curr_True_cli.xlsx").exists());
    assert!(out.join("stage3_cli.safetensors").exists());
}

#[test]
fn test_train_with_correction() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_fixture(temp_dir.path(), 8);

    let assert = run_cli(&["train", config.to_str().unwrap(), "--correct"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert_eq!(stdout.matches("Correction Stage - epoch:").count(), 4);
}

#[test]
fn test_correct_requires_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_fixture(temp_dir.path(), 8);
    run_cli(&["correct", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("init_checkpoint"));
}

#[test]
fn test_correct_from_saved_network() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_fixture(temp_dir.path(), 8);
    run_cli(&["train", config.to_str().unwrap()]).assert().success();

    let checkpoint = temp_dir.path().join("out").join("stage3_cli.safetensors");
    let mut yaml = fs::read_to_string(&config).unwrap();
    yaml.push_str(&format!("init_checkpoint: \"{}\"\n", checkpoint.display()));
    fs::write(&config, yaml).unwrap();

    run_cli(&["correct", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Correction Stage - epoch:4 "))
        .stdout(predicate::str::contains("Label correction finished after 4 epochs"));
}

#[test]
fn test_train_missing_data() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(
        temp_dir.path(),
        r#"
dataset:
  train_path: "/nonexistent/train.safetensors"
  test_path: "/nonexistent/test.safetensors"
  filter_path: "/nonexistent/filter.safetensors"
"#,
    );
    run_cli(&["train", config.to_str().unwrap()]).assert().failure();
}
