use std::path::Path;
use std::process::{Command, Output};

fn snapvault(repo: &Path, profile: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_snapvault"))
        .args(args)
        .arg("--repo")
        .arg(repo)
        .arg("--profile")
        .arg(profile)
        .args(["--password", "hunter2", "--backend", "local", "--quiet"])
        .env_remove("SNAPVAULT_PARALLELISM")
        .output()
        .unwrap()
}

#[test]
fn backup_list_restore_check_roundtrip() {
    let work = tempfile::tempdir().unwrap();
    let repo = work.path().join("repo");
    let profile = work.path().join("config.toml");
    std::fs::write(&profile, "excludes = [\"*.tmp\"]\n").unwrap();

    let source = work.path().join("docs");
    std::fs::create_dir_all(source.join("nested")).unwrap();
    std::fs::write(source.join("readme.md"), b"# docs\n").unwrap();
    std::fs::write(source.join("nested/notes.txt"), b"notes").unwrap();
    std::fs::write(source.join("scratch.tmp"), b"skip me").unwrap();

    let out = snapvault(&repo, &profile, &["init", "--kdf-memory", "1024", "--chunk-size", "4"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = snapvault(
        &repo,
        &profile,
        &["backup", source.to_str().unwrap(), "--tag", "docs"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = snapvault(&repo, &profile, &["snapshots", "--json"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let rows: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["tags"][0], "docs");
    let id = rows[0]["id"].as_str().unwrap().to_string();

    let target = work.path().join("restored");
    let out = snapvault(&repo, &profile, &["restore", &id[..8], target.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(std::fs::read(target.join("docs/readme.md")).unwrap(), b"# docs\n");
    assert_eq!(std::fs::read(target.join("docs/nested/notes.txt")).unwrap(), b"notes");
    assert!(!target.join("docs/scratch.tmp").exists());

    let out = snapvault(&repo, &profile, &["check", "--read-data"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn wrong_password_exits_with_its_code() {
    let work = tempfile::tempdir().unwrap();
    let repo = work.path().join("repo");
    let profile = work.path().join("config.toml");
    std::fs::write(&profile, "").unwrap();

    let out = snapvault(&repo, &profile, &["init", "--kdf-memory", "1024"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = Command::new(env!("CARGO_BIN_EXE_snapvault"))
        .args(["snapshots", "--repo"])
        .arg(&repo)
        .arg("--profile")
        .arg(&profile)
        .args(["--password", "wrong", "--backend", "local", "--quiet"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(3));
}

#[test]
fn forget_keeps_latest_snapshot() {
    let work = tempfile::tempdir().unwrap();
    let repo = work.path().join("repo");
    let profile = work.path().join("config.toml");
    std::fs::write(&profile, "").unwrap();
    let source = work.path().join("data");
    std::fs::create_dir_all(&source).unwrap();

    let out = snapvault(&repo, &profile, &["init", "--kdf-memory", "1024", "--chunk-size", "4"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    for content in ["v1", "v2", "v3"] {
        std::fs::write(source.join("file.txt"), content).unwrap();
        let out = snapvault(&repo, &profile, &["backup", source.to_str().unwrap()]);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    }

    let out = snapvault(&repo, &profile, &["forget", "--keep-last", "1", "--dry-run"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Would remove 2 snapshots"));
    assert_eq!(std::fs::read_dir(repo.join("snapshots")).unwrap().count(), 3);

    let out = snapvault(&repo, &profile, &["forget", "--keep-last", "1"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = snapvault(&repo, &profile, &["snapshots", "--json"]);
    let rows: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 1);

    let out = snapvault(&repo, &profile, &["forget"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn init_rejects_oversized_chunks() {
    let work = tempfile::tempdir().unwrap();
    let repo = work.path().join("repo");
    let profile = work.path().join("config.toml");
    std::fs::write(&profile, "").unwrap();

    let out = snapvault(&repo, &profile, &["init", "--kdf-memory", "1024", "--chunk-size", "8192"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!repo.join("config").exists());

    let out = snapvault(&repo, &profile, &["init", "--kdf-memory", "1024", "--chunk-size", "4194304"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn version_prints_engine_version() {
    let out = Command::new(env!("CARGO_BIN_EXE_snapvault"))
        .arg("version")
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("snapvault-v"));
}
