use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

const PROJ_LISTING: &str = "proj/\nproj/a.txt\nproj/sub/\n";

fn ziptool() -> Command {
    let mut cmd = Command::cargo_bin("ziptool").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn no_mode_flag_prints_usage_and_succeeds() {
    ziptool()
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::starts_with("Usage:"))
        .stderr(predicate::str::contains("ziptool -c zipfile.zip src"));
}

#[test]
fn create_list_extract_cycle() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let proj = dir.path().join("proj");
    fs::create_dir_all(proj.join("sub"))?;
    fs::write(proj.join("a.txt"), "hello")?;
    let archive = dir.path().join("proj.zip");

    // Create: archive first, then source
    ziptool()
        .arg("-c")
        .arg(&archive)
        .arg(&proj)
        .assert()
        .success()
        .stdout(PROJ_LISTING);
    assert!(archive.exists());

    // Listing is stable across runs
    let first = ziptool().arg("-l").arg(&archive).output()?;
    let second = ziptool().arg("-l").arg(&archive).output()?;
    assert!(first.status.success());
    assert_eq!(String::from_utf8(first.stdout.clone())?, PROJ_LISTING);
    assert_eq!(first.stdout, second.stdout);

    let out = dir.path().join("out");
    fs::create_dir(&out)?;
    ziptool()
        .arg("-e")
        .arg(&archive)
        .arg(&out)
        .assert()
        .success()
        .stdout(PROJ_LISTING);

    assert_eq!(fs::read_to_string(out.join("proj/a.txt"))?, "hello");
    assert!(out.join("proj/sub").is_dir());
    Ok(())
}

#[test]
fn create_wins_when_several_modes_are_given() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let proj = dir.path().join("proj");
    fs::create_dir_all(proj.join("sub"))?;
    fs::write(proj.join("a.txt"), "hello")?;
    let archive = dir.path().join("proj.zip");

    ziptool()
        .arg("-l")
        .arg("-c")
        .arg(&archive)
        .arg(&proj)
        .assert()
        .success()
        .stdout(PROJ_LISTING);
    assert!(archive.exists());
    Ok(())
}

#[test]
fn operation_errors_go_to_stdout_with_success_status() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.zip");

    ziptool()
        .arg("-l")
        .arg(&missing)
        .assert()
        .success()
        .stdout(predicate::str::starts_with(format!("open {}", missing.display())));
}

#[test]
fn corrupt_archive_is_reported() {
    let dir = tempdir().unwrap();
    let bogus = dir.path().join("bogus.zip");
    fs::write(&bogus, "definitely not a zip file").unwrap();

    ziptool()
        .arg("-l")
        .arg(&bogus)
        .assert()
        .success()
        .stdout("Not a valid ZIP file\n");
}

#[test]
fn missing_arguments_are_reported() {
    ziptool()
        .arg("-c")
        .arg("only.zip")
        .assert()
        .success()
        .stdout("missing source argument\n");
}
