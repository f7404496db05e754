use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

/// Binary under test, isolated from any user or environment configuration.
fn emitwatch(home: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("emitwatch"));
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn shows_help() -> Result<(), Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    emitwatch(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Follow a live emit feed"))
        .stdout(predicate::str::contains("--endpoint"))
        .stdout(predicate::str::contains("--types"));
    Ok(())
}

#[test]
fn shows_version() -> Result<(), Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    emitwatch(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("emitwatch "));
    Ok(())
}

#[test]
fn prints_effective_config_with_overrides() -> Result<(), Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    let store_dir = home.path().join("log");
    emitwatch(&home)
        .args(["--print-config", "--endpoint", "ws://feed.test/ws/logs"])
        .arg("--store-dir")
        .arg(&store_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"endpoint\": \"ws://feed.test/ws/logs\""))
        .stdout(predicate::str::contains("\"flush_interval_ms\": 3000"));
    Ok(())
}

#[test]
fn explicit_config_file_is_layered() -> Result<(), Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    let config_path = home.path().join("emitwatch.toml");
    std::fs::write(
        &config_path,
        "[ingest]\nmax_visible = 50\n\n[filter]\nspeeding_cap = 5\n",
    )?;
    emitwatch(&home)
        .arg("--print-config")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"max_visible\": 50"))
        .stdout(predicate::str::contains("\"speeding_cap\": 5"));
    Ok(())
}

#[test]
fn rejects_missing_config_file() -> Result<(), Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    emitwatch(&home)
        .args(["--print-config", "--config"])
        .arg(home.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
    Ok(())
}

#[test]
fn rejects_empty_endpoint() -> Result<(), Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    emitwatch(&home)
        .args(["--print-config", "--endpoint", ""])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
    Ok(())
}

#[test]
fn rejects_unknown_output_format() -> Result<(), Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    emitwatch(&home)
        .args(["--format", "xml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown format: xml"));
    Ok(())
}
