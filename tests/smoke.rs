//! Smoke tests -- verify the binary runs and fails fast on bad schedules.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &Path, schedule: &str) -> std::path::PathBuf {
    let schedule_path = dir.join("schedules.json");
    std::fs::write(&schedule_path, schedule).unwrap();
    let config_path = dir.join("settings.toml");
    std::fs::write(
        &config_path,
        format!(
            "schedule_file = {:?}\n[database]\npath = {:?}\n",
            schedule_path.to_str().unwrap(),
            dir.join("ingest.db").to_str().unwrap()
        ),
    )
    .unwrap();
    config_path
}

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("ingestkeeper").unwrap();
    cmd.env_remove("INGEST_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("SCD2"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test]
fn test_cli_version() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ingestkeeper"));
}

#[test]
fn test_history_subcommand_exists() {
    cli().args(["history", "--help"]).assert().success();
}

#[test]
fn test_dry_run_valid_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"{"jobs":[
            {"name":"fetch_transactions","schedule":{"type":"interval","seconds":60}},
            {"name":"fetch_records","schedule":{"type":"cron","expression":"0 2 * * 0"},
             "depends_on":["fetch_transactions"]}
        ]}"#,
    );

    cli()
        .arg("--config")
        .arg(&config)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch_transactions"))
        .stdout(predicate::str::contains("cron '0 2 * * 0'"));
    assert!(!dir.path().join("ingest.db").exists());
}

#[test]
fn test_cyclic_schedule_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"{"jobs":[
            {"name":"fetch_transactions","schedule":{"type":"interval","seconds":60},"depends_on":["fetch_records"]},
            {"name":"fetch_records","schedule":{"type":"interval","seconds":60},"depends_on":["fetch_transactions"]}
        ]}"#,
    );

    cli()
        .arg("--config")
        .arg(&config)
        .arg("--dry-run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cyclic dependency"));
}

#[test]
fn test_invalid_cron_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"{"jobs":[{"name":"fetch_transactions","schedule":{"type":"cron","expression":"61 * * * *"}}]}"#,
    );

    cli()
        .arg("--config")
        .arg(&config)
        .arg("--once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid schedule"));
}

#[test]
fn test_unregistered_job_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"{"jobs":[{"name":"no_such_job","schedule":{"type":"interval","seconds":60}}]}"#,
    );

    cli()
        .arg("--config")
        .arg(&config)
        .arg("--dry-run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not registered"));
}

#[test]
fn test_once_runs_due_jobs_and_records_history() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"{"jobs":[{"name":"fetch_transactions","schedule":{"type":"interval","seconds":3600},"args":{"limit":3}}]}"#,
    );

    cli()
        .arg("--config")
        .arg(&config)
        .arg("--once")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"succeeded\""))
        .stdout(predicate::str::contains("fetch_transactions"));

    cli()
        .arg("--config")
        .arg(&config)
        .args(["history", "--job", "fetch_transactions"])
        .assert()
        .success()
        .stdout(predicate::str::contains("job_end"))
        .stdout(predicate::str::contains("scd2_upsert"));
}

#[test]
fn test_keys_add_list_remove() {
    let dir = tempfile::tempdir().unwrap();
    let keys_path = dir.path().join("keys.json");
    let config = dir.path().join("settings.toml");
    std::fs::write(
        &config,
        format!("[secrets]\npath = {:?}\n", keys_path.to_str().unwrap()),
    )
    .unwrap();

    cli()
        .arg("--config")
        .arg(&config)
        .args(["keys", "add", "opendata_service_key"])
        .write_stdin("s3cr3t\n")
        .assert()
        .success();
    assert!(std::fs::read_to_string(&keys_path).unwrap().contains("s3cr3t"));

    cli()
        .arg("--config")
        .arg(&config)
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("opendata_service_key"))
        .stdout(predicate::str::contains("s3cr3t").not());

    cli()
        .arg("--config")
        .arg(&config)
        .args(["keys", "remove", "opendata_service_key"])
        .assert()
        .success();
    cli()
        .arg("--config")
        .arg(&config)
        .args(["keys", "remove", "opendata_service_key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no key named"));
}

#[test]
fn test_keys_without_key_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), r#"{"jobs":[]}"#);
    cli()
        .arg("--config")
        .arg(&config)
        .args(["keys", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no key file configured"));
}

#[test]
fn test_broken_env_config_is_logged() {
    let dir = tempfile::tempdir().unwrap();
    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[runner\n").unwrap();

    cli()
        .current_dir(dir.path())
        .env("INGEST_CONFIG", &broken)
        .args(["history", "--limit", "1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("could not be loaded"));
}
