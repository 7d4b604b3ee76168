//! Uninstall and reset behavior over a fabricated on-disk layout. No
//! network involved: everything here drives the layout directly.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use unbrew::error::UbError;
use unbrew::manager::{Manager, uninstall_cask_tree, uninstall_formula_tree};
use unbrew::paths::Paths;
use unbrew::receipt::CaskReceipt;

fn manager_at(base: &Path) -> Manager {
    Manager::with_paths(Paths::from_base(base), 2)
}

fn seed_cask(paths: &Paths, token: &str, version: &str) -> (PathBuf, PathBuf) {
    let version_dir = paths.caskroom.join(token).join(version);
    let app_path = paths.applications.join("Cursor.app");
    let bin_path = paths.bin.join(token);

    std::fs::create_dir_all(&version_dir).unwrap();
    std::fs::create_dir_all(&app_path).unwrap();
    std::fs::create_dir_all(&paths.bin).unwrap();
    std::fs::write(&bin_path, b"stub").unwrap();
    std::fs::write(version_dir.join("payload.txt"), b"payload").unwrap();

    CaskReceipt {
        token: token.to_string(),
        version: version.to_string(),
        app_path: app_path.clone(),
        linked_binaries: vec![bin_path.clone()],
    }
    .write(&version_dir)
    .unwrap();

    (app_path, bin_path)
}

#[test]
fn cask_uninstall_removes_receipt_targets() {
    let base = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(base.path());
    let (app_path, bin_path) = seed_cask(&paths, "cursor", "2.5.17");

    let record = uninstall_cask_tree(&paths, "cursor", None).unwrap();

    assert_eq!(record.name, "cursor");
    assert!(record.files > 0);
    assert!(record.path.ends_with("cursor/2.5.17"));

    assert!(!paths.caskroom.join("cursor").exists());
    assert!(!app_path.exists());
    assert!(!bin_path.exists());
}

#[test]
fn cask_uninstall_tolerates_a_missing_receipt() {
    let base = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(base.path());
    let version_dir = paths.caskroom.join("cursor/1.0.0");
    std::fs::create_dir_all(&version_dir).unwrap();
    std::fs::write(version_dir.join("payload.txt"), b"payload").unwrap();

    let record = uninstall_cask_tree(&paths, "cursor", None).unwrap();
    assert_eq!(record.files, 1);
    assert!(!paths.caskroom.join("cursor").exists());
}

#[test]
fn uninstalling_an_unknown_cask_fails() {
    let base = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(base.path());
    let err = uninstall_cask_tree(&paths, "ghost", None).unwrap_err();
    assert!(matches!(err, UbError::CaskNotInstalled(name) if name == "ghost"));
}

#[test]
fn formula_uninstall_drops_links_and_reports_stats() {
    let base = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(base.path());
    let version_bin = paths.cellar.join("hello/2.12.2/bin");
    std::fs::create_dir_all(&version_bin).unwrap();
    std::fs::create_dir_all(&paths.bin).unwrap();
    std::fs::create_dir_all(&paths.sbin).unwrap();
    std::fs::write(version_bin.join("hello"), b"#!/bin/sh\n").unwrap();
    std::os::unix::fs::symlink(version_bin.join("hello"), paths.bin.join("hello")).unwrap();

    let record = uninstall_formula_tree(&paths, "hello", None).unwrap();

    assert_eq!(record.name, "hello");
    assert_eq!(record.files, 1);
    assert!(record.path.ends_with("hello/2.12.2"));
    assert!(!paths.cellar.join("hello").exists());
    assert!(!paths.bin.join("hello").exists());
}

#[test]
fn formula_display_path_is_the_lexicographically_last_version() {
    let base = tempfile::tempdir().unwrap();
    let paths = Paths::from_base(base.path());
    std::fs::create_dir_all(paths.cellar.join("hello/1.10.0")).unwrap();
    std::fs::create_dir_all(paths.cellar.join("hello/1.2.0")).unwrap();
    std::fs::create_dir_all(&paths.bin).unwrap();
    std::fs::create_dir_all(&paths.sbin).unwrap();

    let record = uninstall_formula_tree(&paths, "hello", None).unwrap();
    // Lexicographic, not semantic: 1.2.0 sorts after 1.10.0.
    assert!(record.path.ends_with("hello/1.2.0"));
}

#[tokio::test]
async fn uninstall_dispatches_casks_without_touching_the_api() {
    let base = tempfile::tempdir().unwrap();
    let manager = manager_at(base.path());
    manager.ensure_layout().unwrap();
    seed_cask(&manager.paths, "cursor", "2.5.17");

    let summary = manager
        .uninstall_with_autoremove(&CancellationToken::new(), &["cursor".to_string()])
        .await
        .unwrap();

    assert_eq!(summary.removed.len(), 1);
    assert_eq!(summary.removed[0].name, "cursor");
    assert!(summary.auto_remove.is_empty());
}

#[tokio::test]
async fn uninstalling_a_package_that_is_not_installed_fails() {
    let base = tempfile::tempdir().unwrap();
    let manager = manager_at(base.path());
    manager.ensure_layout().unwrap();

    let err = manager
        .uninstall_with_autoremove(&CancellationToken::new(), &["ghost".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "package \"ghost\" is not installed");
}

#[tokio::test]
async fn reset_removes_casks_and_recreates_the_cache() {
    let base = tempfile::tempdir().unwrap();
    let manager = manager_at(base.path());
    manager.ensure_layout().unwrap();
    let (app_path, bin_path) = seed_cask(&manager.paths, "cursor", "1.0.0");

    let cached_bottle = manager.paths.cache.join("bottles/hello.src");
    let cached_api = manager.paths.cache.join("api/formula.src");
    std::fs::create_dir_all(cached_bottle.parent().unwrap()).unwrap();
    std::fs::create_dir_all(cached_api.parent().unwrap()).unwrap();
    std::fs::write(&cached_bottle, b"bottle").unwrap();
    std::fs::write(&cached_api, b"api").unwrap();

    manager.reset(&CancellationToken::new()).await.unwrap();

    assert!(!manager.paths.caskroom.join("cursor").exists());
    assert!(!app_path.exists());
    assert!(!bin_path.exists());
    assert!(!cached_bottle.exists());
    assert!(!cached_api.exists());
    assert!(manager.paths.cache.is_dir());
    assert!(manager.paths.cellar.is_dir());
}

#[tokio::test]
async fn reset_twice_succeeds() {
    let base = tempfile::tempdir().unwrap();
    let manager = manager_at(base.path());
    manager.ensure_layout().unwrap();

    let cancel = CancellationToken::new();
    manager.reset(&cancel).await.unwrap();
    manager.reset(&cancel).await.unwrap();
}

#[test]
fn list_and_prefix_read_the_cellar() {
    let base = tempfile::tempdir().unwrap();
    let manager = manager_at(base.path());
    std::fs::create_dir_all(manager.paths.cellar.join("ffmpeg/8.0.1")).unwrap();
    std::fs::create_dir_all(manager.paths.cellar.join("hello/2.12.2")).unwrap();

    assert_eq!(
        manager.list_installed().unwrap(),
        vec!["ffmpeg", "hello"]
    );
    assert_eq!(
        manager.installed_prefix("hello").unwrap(),
        manager.paths.cellar.join("hello/2.12.2")
    );

    let err = manager.installed_prefix("ghost").unwrap_err();
    assert!(matches!(err, UbError::FormulaNotInstalled(name) if name == "ghost"));
}
