use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn minerctl(data_dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("minerctl");
    cmd.current_dir(data_dir.path())
        .env("MINER_DATA_DIR", data_dir.path())
        .env_remove("MINER_JOBS_DIR")
        .env_remove("MINER_CONFIG")
        .env_remove("MINER_API_URL")
        .env_remove("API_URL")
        .env_remove("MINER_REUSE_ARTIFACTS")
        .env_remove("MINER_EXECUTION_TIMEOUT")
        .env_remove("MINER_REQUEST_TIMEOUT")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_every_command() {
    let mut cmd = cargo_bin_cmd!("minerctl");
    let output = cmd.arg("--help").assert().success().get_output().stdout.clone();
    let text = String::from_utf8_lossy(&output);
    for command in [
        "login",
        "logout",
        "register",
        "pending-jobs",
        "job-details",
        "start-training",
        "fetch-job",
        "edit-script",
        "execute-job",
        "unlock",
        "status",
    ] {
        assert!(text.contains(command), "help missing {command}");
    }
}

#[test]
fn start_training_help_documents_flags() {
    let mut cmd = cargo_bin_cmd!("minerctl");
    let output = cmd
        .arg("start-training")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("--doc-id"), "start-training help missing --doc-id");
    assert!(
        text.contains("--reuse-artifacts"),
        "start-training help missing --reuse-artifacts"
    );
    assert!(
        text.contains("--fail-on-job-error"),
        "start-training help missing --fail-on-job-error"
    );
}

#[test]
fn backend_commands_without_login_exit_with_two() {
    let dir = TempDir::new().unwrap();
    minerctl(&dir)
        .arg("pending-jobs")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not authenticated"));

    minerctl(&dir)
        .args(["execute-job", "--doc-id", "job-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("job-1"));
}

#[test]
fn half_written_credentials_are_reported_as_corrupted() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".token"), "tok").unwrap();

    minerctl(&dir)
        .args(["job-details", "--doc-id", "job-1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("log in again"));
}

#[test]
fn status_and_unlock_work_offline() {
    let dir = TempDir::new().unwrap();
    minerctl(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no job workspaces"));

    let job = dir.path().join("jobs").join("job-5");
    std::fs::create_dir_all(&job).unwrap();
    std::fs::write(job.join(".lock"), r#"{"pid":1,"acquiredAt":"2024-01-01T00:00:00Z"}"#)
        .unwrap();

    minerctl(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("job-5"));

    minerctl(&dir)
        .args(["unlock", "--doc-id", "job-5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed lock on job-5"));
    assert!(!job.join(".lock").exists());

    minerctl(&dir)
        .args(["unlock", "--doc-id", "job-5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not locked"));
}

#[test]
fn logout_is_idempotent() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(".token"), "tok").unwrap();
    std::fs::write(dir.path().join(".minerId"), "7").unwrap();

    minerctl(&dir).arg("logout").assert().success();
    minerctl(&dir).arg("logout").assert().success();
    assert!(!dir.path().join(".token").exists());
    assert!(!dir.path().join(".minerId").exists());
}
