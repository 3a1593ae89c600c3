#![allow(missing_docs)]

use std::fs;

use idb_coordinator::{
    config::ConfigError, ClientId, ClientLink, CoordinatorConfig, DatabaseIdentifier,
    DatabaseManager, DbError, RequestId,
};
use tempfile::TempDir;

#[test]
fn persisted_config_loads_back_unchanged() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("nested").join("config.toml");

    let mut config = CoordinatorConfig::durable();
    config.quota.write_cost = 9;
    config.logging.filter = "idb_coordinator=debug".into();
    let written = config.persist(Some(path.clone())).expect("persist");
    assert_eq!(written, path);

    let loaded = CoordinatorConfig::load(Some(path)).expect("load");
    assert_eq!(loaded, config);
}

#[test]
fn missing_file_yields_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let loaded = CoordinatorConfig::load(Some(dir.path().join("absent.toml"))).expect("load");
    assert_eq!(loaded, CoordinatorConfig::default());
}

#[test]
fn malformed_file_reports_its_path() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(&path, "[quota]\nwrite_cost = \"lots\"\n").expect("write config");

    match CoordinatorConfig::load(Some(path.clone())) {
        Err(ConfigError::Parse { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected a parse error, got {other:?}"),
    }
}

#[test]
fn storage_section_reads_from_toml() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        "[storage]\nephemeral = true\n\n[logging]\nfilter = \"warn\"\n",
    )
    .expect("write config");

    let loaded = CoordinatorConfig::load(Some(path)).expect("load");
    assert!(loaded.storage.ephemeral);
    assert!(!loaded.storage.simultaneous_read_write);
    assert_eq!(loaded.logging.filter, "warn");
    assert_eq!(loaded.quota.origin_limit_bytes, None);
}

#[tokio::test]
async fn origin_limit_from_config_gates_the_first_open() {
    let mut config = CoordinatorConfig::default();
    config.quota.origin_limit_bytes = Some(1);
    let manager = DatabaseManager::from_config(&config);

    let handle = manager.database(&DatabaseIdentifier::new("tiny", "https://tiny.test"));
    let (client, _events) = ClientLink::new(ClientId(1));
    let result = handle.open(client, RequestId(1), None).await;
    assert!(matches!(result, Err(DbError::QuotaExceeded(_))), "got {result:?}");

    manager.shutdown().await;
}
