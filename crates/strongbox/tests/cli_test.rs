use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::{tempdir, TempDir};

/// A base directory with a 30 byte `world` tree and a config pointing at it.
fn setup() -> TempDir {
    let temp = tempdir().unwrap();
    let base = temp.path().join("server");
    fs::create_dir_all(base.join("world/region")).unwrap();
    fs::write(base.join("world/level.dat"), vec![1u8; 10]).unwrap();
    fs::write(base.join("world/region/r.0.0.mca"), vec![2u8; 20]).unwrap();
    fs::write(
        temp.path().join("config.toml"),
        format!(
            r#"
[global]
base_dir = "{}"
backup_dir = "Backups"
"#,
            base.display()
        ),
    )
    .unwrap();
    temp
}

fn strongbox(temp: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo_bin!("strongbox"));
    cmd.env("STRONGBOX_CONFIG", temp.join("config.toml"))
        .env("XDG_DATA_HOME", temp.join("data"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_list_empty() {
    let temp = setup();
    strongbox(temp.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups found."));
}

#[test]
fn test_missing_config_exits_with_code_2() {
    let temp = tempdir().unwrap();
    strongbox(temp.path())
        .arg("list")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error loading configuration"));
}

#[test]
fn test_backup_then_list() {
    let temp = setup();

    let output = strongbox(temp.path())
        .args(["--json", "backup", "world", "world"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let snapshot: serde_json::Value =
        serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(snapshot["state"], "Done");
    assert_eq!(snapshot["data_size"], 30);
    let uid = snapshot["uid"].as_str().unwrap().to_string();

    strongbox(temp.path())
        .args(["--json", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(r#""uid": "{}""#, uid)))
        .stdout(predicate::str::contains(r#""size": 30"#));

    strongbox(temp.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(uid.as_str()))
        .stdout(predicate::str::contains("30 B"));

    assert!(temp.path().join("data/strongbox/strongbox.log").exists());
}

#[test]
fn test_restore_round_trip() {
    let temp = setup();
    let base = temp.path().join("server");

    let output = strongbox(temp.path())
        .args(["--json", "backup", "world", "world", "--dest", "Backups/manual"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let snapshot: serde_json::Value =
        serde_json::from_slice(&output.stdout).unwrap();
    let uid = snapshot["uid"].as_str().unwrap().to_string();
    assert!(base.join("Backups/manual/backup.info").is_file());

    fs::write(base.join("world/level.dat"), b"broken").unwrap();
    fs::write(base.join("world/stale.dat"), b"stale").unwrap();

    strongbox(temp.path())
        .args(["--quiet", "restore", &uid, "--clear"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    assert_eq!(fs::read(base.join("world/level.dat")).unwrap(), vec![1u8; 10]);
    assert!(!base.join("world/stale.dat").exists());
}

#[test]
fn test_zip_backup_round_trip() {
    let temp = setup();
    let base = temp.path().join("server");

    let output = strongbox(temp.path())
        .args(["--json", "backup", "world", "world", "--zip"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let snapshot: serde_json::Value =
        serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(snapshot["state"], "Done");
    let uid = snapshot["uid"].as_str().unwrap().to_string();
    let archive = snapshot["destination"].as_str().unwrap().to_string();
    assert!(archive.ends_with(".zip"));
    assert!(Path::new(&archive).is_file());

    fs::remove_dir_all(base.join("world")).unwrap();
    strongbox(temp.path())
        .args(["--quiet", "restore", &uid])
        .assert()
        .success();

    assert_eq!(fs::read(base.join("world/level.dat")).unwrap(), vec![1u8; 10]);
    assert_eq!(fs::read(base.join("world/region/r.0.0.mca")).unwrap(), vec![2u8; 20]);
}

#[test]
fn test_restore_unknown_uid_fails() {
    let temp = setup();
    strongbox(temp.path())
        .args(["restore", "nope1234"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown backup 'nope1234'"));
}

#[test]
fn test_backup_missing_source_fails() {
    let temp = setup();
    strongbox(temp.path())
        .args(["backup", "ghost", "no/such/dir"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
