use snapvault_api::{
    BackendKind, Credentials, ErrorCode, ForgetPolicy, RepositoryHandle, open_or_init, open_or_init_with, status_code,
};
use snapvault_core::{ChunkerParams, KdfParams, RepositoryOptions};
use std::path::Path;

fn cheap_options() -> RepositoryOptions {
    RepositoryOptions {
        parallelism: 2,
        pack_size: 64 * 1024,
        chunker: ChunkerParams::with_average(4096),
        kdf: KdfParams::with_cost(1024, 1, 1),
        ..Default::default()
    }
}

async fn create(location: &Path) -> RepositoryHandle {
    open_or_init_with(
        &location.to_string_lossy(),
        BackendKind::Local,
        "hunter2",
        &Credentials::default(),
        cheap_options(),
        true,
    )
    .await
    .unwrap()
}

async fn reopen(location: &Path, password: &str) -> snapvault_api::Result<RepositoryHandle> {
    open_or_init_with(
        &location.to_string_lossy(),
        BackendKind::Local,
        password,
        &Credentials::default(),
        cheap_options(),
        false,
    )
    .await
}

#[tokio::test]
async fn hello_scenario_through_facade() {
    let repo_dir = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let src = source.path().join("src");
    std::fs::create_dir_all(src.join("b")).unwrap();
    std::fs::write(src.join("a.txt"), b"hello").unwrap();
    std::fs::write(src.join("b/b.txt"), b"hello").unwrap();

    let handle = create(repo_dir.path()).await;
    let id = handle
        .backup(&[src.to_string_lossy().to_string()], &["nightly".to_string()])
        .await
        .unwrap();

    let listed = handle.list_snapshots().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].tags, vec!["nightly".to_string()]);
    assert_eq!(handle.check().await.unwrap(), 0);

    let target = tempfile::tempdir().unwrap();
    handle.restore(&id, target.path()).await.unwrap();
    assert_eq!(std::fs::read(target.path().join("src/a.txt")).unwrap(), b"hello");
    assert_eq!(std::fs::read(target.path().join("src/b/b.txt")).unwrap(), b"hello");

    handle.close().await.unwrap();
    handle.close().await.unwrap();
    let result = handle.list_snapshots().await;
    assert_eq!(status_code(&result), ErrorCode::Closed.as_i32());
}

#[tokio::test]
async fn open_failures_have_stable_codes() {
    let repo_dir = tempfile::tempdir().unwrap();

    let missing = reopen(repo_dir.path(), "hunter2").await;
    assert_eq!(status_code(&missing), -2);

    create(repo_dir.path()).await.close().await.unwrap();

    let wrong = reopen(repo_dir.path(), "hunter3").await;
    assert_eq!(status_code(&wrong), -3);

    let again = open_or_init_with(
        &repo_dir.path().to_string_lossy(),
        BackendKind::Local,
        "hunter2",
        &Credentials::default(),
        cheap_options(),
        true,
    )
    .await;
    assert_eq!(status_code(&again), -1);

    let empty_password = open_or_init(
        &repo_dir.path().to_string_lossy(),
        BackendKind::Local,
        "",
        &Credentials::default(),
        0,
        false,
    )
    .await;
    assert_eq!(status_code(&empty_password), -1);
}

#[tokio::test]
async fn empty_backup_and_unknown_snapshot() {
    let repo_dir = tempfile::tempdir().unwrap();
    let handle = create(repo_dir.path()).await;

    let result = handle.backup(&[], &[]).await;
    assert_eq!(status_code(&result), ErrorCode::InvalidParams.as_i32());
    assert!(handle.list_snapshots().await.unwrap().is_empty());

    let target = tempfile::tempdir().unwrap();
    let result = handle.restore(&"f".repeat(64), target.path()).await;
    assert_eq!(status_code(&result), ErrorCode::NotFound.as_i32());
}

#[tokio::test]
async fn forget_through_facade() {
    let repo_dir = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let src = source.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("a.txt"), b"one").unwrap();

    let handle = create(repo_dir.path()).await;
    let paths = [src.to_string_lossy().to_string()];
    let old = handle.backup(&paths, &[]).await.unwrap();
    std::fs::write(src.join("a.txt"), b"two").unwrap();
    let new = handle.backup(&paths, &[]).await.unwrap();

    let empty = handle.forget(&ForgetPolicy::default()).await;
    assert_eq!(status_code(&empty), ErrorCode::InvalidParams.as_i32());

    let removed = handle
        .forget(&ForgetPolicy { keep_last: 1, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(removed, vec![old]);
    let listed = handle.list_snapshots().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, new);
}
