//! Environment-derived configuration. Kept in its own test binary because
//! it mutates process-wide environment variables.

use unbrew::manager::uninstall_cask_tree;
use unbrew::paths::Paths;
use unbrew::receipt::CaskReceipt;

#[test]
fn ub_base_dir_overrides_the_probed_base() {
    let base = tempfile::tempdir().unwrap();
    unsafe {
        std::env::set_var("UB_BASE_DIR", base.path());
    }

    let paths = Paths::from_env();
    assert_eq!(paths.base_dir, base.path());
    assert_eq!(paths.prefix, base.path().join("ub"));
    assert_eq!(paths.repo, base.path().join("unbrew"));
    assert_eq!(paths.cellar, base.path().join("ub/Cellar"));
    assert_eq!(paths.caskroom, base.path().join("ub/Caskroom"));
    assert_eq!(paths.cache, base.path().join("ub/cache"));
    assert_eq!(paths.bin, base.path().join("ub/bin"));
    assert_eq!(paths.sbin, base.path().join("ub/sbin"));
    assert_eq!(paths.applications, base.path().join("ub/Applications"));

    unsafe {
        std::env::remove_var("UB_BASE_DIR");
    }
}

#[test]
fn cask_uninstall_also_clears_the_home_applications_copy() {
    let base = tempfile::tempdir().unwrap();
    let home = base.path().join("home");
    unsafe {
        std::env::set_var("HOME", &home);
    }

    let paths = Paths::from_base(base.path());
    let version_dir = paths.caskroom.join("cursor/2.5.17");
    let receipt_app_path = paths.applications.join("Cursor.app");
    let home_app_path = home.join("Applications/Cursor.app");

    std::fs::create_dir_all(&version_dir).unwrap();
    std::fs::create_dir_all(&home_app_path).unwrap();
    std::fs::write(version_dir.join("payload.txt"), b"payload").unwrap();
    CaskReceipt {
        token: "cursor".to_string(),
        version: "2.5.17".to_string(),
        app_path: receipt_app_path,
        linked_binaries: vec![],
    }
    .write(&version_dir)
    .unwrap();

    uninstall_cask_tree(&paths, "cursor", None).unwrap();

    assert!(!home_app_path.exists());
    assert!(!paths.caskroom.join("cursor").exists());
}
