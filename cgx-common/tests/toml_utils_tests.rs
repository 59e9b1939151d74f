//! Tests for TOML atomic write utilities
//!
//! Covers temp file + rename, round-tripping of every section, and 0600
//! permissions on Unix (the file may hold an API key).

use cgx_common::config::{load_toml_config, write_toml_config, LoggingConfig, ProviderSettings, TomlConfig};
use std::path::PathBuf;
use tempfile::TempDir;

fn sample_config() -> TomlConfig {
    TomlConfig {
        root_folder: Some(PathBuf::from("/srv/cgx")),
        port: Some(5800),
        logging: LoggingConfig {
            level: "debug".to_string(),
            file: None,
        },
        provider: ProviderSettings {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        },
        pipeline: None,
    }
}

#[test]
fn test_atomic_write_leaves_no_temp_file() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("cgx-pipeline.toml");

    write_toml_config(&sample_config(), &target).unwrap();

    assert!(target.exists());
    assert!(!temp_dir.path().join("cgx-pipeline.toml.tmp").exists());
}

#[test]
fn test_write_then_load_preserves_fields() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("cgx-pipeline.toml");

    write_toml_config(&sample_config(), &target).unwrap();
    let loaded = load_toml_config(&target).unwrap().unwrap();

    assert_eq!(loaded.root_folder, Some(PathBuf::from("/srv/cgx")));
    assert_eq!(loaded.port, Some(5800));
    assert_eq!(loaded.logging.level, "debug");
    assert_eq!(loaded.provider.api_key.as_deref(), Some("sk-test"));
    assert_eq!(loaded.provider, sample_config().provider);
}

#[test]
fn test_write_creates_parent_directories() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("a").join("b").join("cgx-pipeline.toml");

    write_toml_config(&sample_config(), &target).unwrap();

    assert!(target.exists());
}

#[test]
fn test_pipeline_table_is_kept_raw() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("cgx-pipeline.toml");
    std::fs::write(
        &target,
        "[pipeline]\nmax_parallel_requests = 8\nrandom_seed = 42\n",
    )
    .unwrap();

    let loaded = load_toml_config(&target).unwrap().unwrap();
    let pipeline = loaded.pipeline.unwrap();

    assert_eq!(pipeline["max_parallel_requests"].as_integer(), Some(8));
    assert_eq!(pipeline["random_seed"].as_integer(), Some(42));
}

#[cfg(unix)]
#[test]
fn test_written_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("cgx-pipeline.toml");
    write_toml_config(&sample_config(), &target).unwrap();

    let mode = std::fs::metadata(&target).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
