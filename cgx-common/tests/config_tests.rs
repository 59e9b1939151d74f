//! Tests for bootstrap configuration and graceful degradation
//!
//! Covers:
//! - Missing TOML files do not cause errors
//! - Default root folder locations per platform
//! - Priority order for root folder resolution (CLI → ENV → TOML → default)
//! - Automatic root folder creation
//!
//! Tests that manipulate CGX_ROOT_FOLDER are marked with #[serial] so they do
//! not race each other.

use cgx_common::config::{
    load_toml_config, write_toml_config, CompiledDefaults, RootFolderInitializer,
    RootFolderResolver, TomlConfig, ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_compiled_defaults_for_current_platform() {
    let defaults = CompiledDefaults::for_current_platform();

    assert!(!defaults.root_folder.as_os_str().is_empty());
    assert_eq!(defaults.log_level, "info");
    assert!(defaults.log_file.is_none());
    assert!(defaults.root_folder.to_string_lossy().contains("cgx"));
}

#[test]
#[serial]
fn test_resolver_with_no_overrides_uses_default() {
    env::remove_var(ROOT_FOLDER_ENV);
    let temp_dir = TempDir::new().unwrap();

    // Point at a config file that does not exist
    let resolver = RootFolderResolver::new("test-module")
        .with_config_path(temp_dir.path().join("missing.toml"));

    assert_eq!(
        resolver.resolve(),
        CompiledDefaults::for_current_platform().root_folder
    );
}

#[test]
#[serial]
fn test_resolver_env_var_beats_toml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("cgx-pipeline.toml");
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/cgx-from-toml")),
        ..Default::default()
    };
    write_toml_config(&config, &config_path).unwrap();

    env::set_var(ROOT_FOLDER_ENV, "/tmp/cgx-from-env");
    let resolver = RootFolderResolver::new("cgx-pipeline").with_config_path(config_path);
    let resolved = resolver.resolve();
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/cgx-from-env"));
}

#[test]
#[serial]
fn test_resolver_cli_beats_env() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/cgx-from-env");
    let resolver = RootFolderResolver::new("cgx-pipeline")
        .with_cli_arg(Some(PathBuf::from("/tmp/cgx-from-cli")));
    let resolved = resolver.resolve();
    env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/tmp/cgx-from-cli"));
}

#[test]
#[serial]
fn test_resolver_reads_root_folder_from_toml() {
    env::remove_var(ROOT_FOLDER_ENV);
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("cgx-pipeline.toml");
    std::fs::write(&config_path, "root_folder = \"/srv/cgx\"\n").unwrap();

    let resolver = RootFolderResolver::new("cgx-pipeline").with_config_path(config_path);

    assert_eq!(resolver.resolve(), PathBuf::from("/srv/cgx"));
}

#[test]
#[serial]
fn test_resolver_malformed_toml_falls_back_to_default() {
    env::remove_var(ROOT_FOLDER_ENV);
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("broken.toml");
    std::fs::write(&config_path, "root_folder = [unterminated").unwrap();

    let resolver = RootFolderResolver::new("cgx-pipeline").with_config_path(config_path);

    assert_eq!(
        resolver.resolve(),
        CompiledDefaults::for_current_platform().root_folder
    );
}

#[test]
fn test_load_missing_config_is_none() {
    let temp_dir = TempDir::new().unwrap();
    let loaded = load_toml_config(&temp_dir.path().join("nope.toml")).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn test_initializer_database_path() {
    let root = PathBuf::from("/tmp/cgx-test-root");
    let initializer = RootFolderInitializer::new(root.clone());

    assert_eq!(initializer.database_path(), root.join("cgx.db"));
    assert!(!initializer.database_exists());
}

#[test]
fn test_initializer_creates_directory_idempotently() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("nested").join("cgx");

    let initializer = RootFolderInitializer::new(root.clone());
    initializer.ensure_directory_exists().unwrap();
    // Second call succeeds too
    initializer.ensure_directory_exists().unwrap();

    assert!(root.is_dir());
}
