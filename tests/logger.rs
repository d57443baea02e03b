use std::fs;
use todoly_sync::backend::factory::create_backend;
use todoly_sync::backend::Backend;
use todoly_sync::config::{LoggingConfig, RemoteConfig};
use todoly_sync::constants::LOG_MEMORY_BACKEND;
use todoly_sync::logger;

#[test]
fn test_disabled_logging_installs_nothing() {
    let config = LoggingConfig::default();
    assert!(!config.enabled);
    assert_eq!(logger::init(&config).unwrap(), None);
}

#[test]
fn test_invalid_level_is_rejected() {
    let config = LoggingConfig {
        enabled: true,
        level: "chatty".to_string(),
        ..LoggingConfig::default()
    };
    assert!(config.level_filter().is_none());
}

#[test]
fn test_default_log_file_path() {
    if let Ok(path) = logger::get_log_file_path() {
        assert!(path.ends_with("todoly/todoly.log"));
    }
}

#[test]
fn test_enabled_logging_writes_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("todoly.log");
    let config = LoggingConfig {
        enabled: true,
        level: "info".to_string(),
        file: Some(path.clone()),
        stderr: false,
    };

    let installed = logger::init(&config).unwrap();
    assert_eq!(installed.as_deref(), Some(path.as_path()));

    log::info!("logger smoke test");
    log::debug!("filtered out");

    // The default remote is the in-process one and says so
    let backend = create_backend(&RemoteConfig::default()).unwrap();
    assert_eq!(backend.backend_type(), "memory");

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("logger smoke test"));
    assert!(!content.contains("filtered out"));
    assert!(content.contains(LOG_MEMORY_BACKEND));

    // A second init keeps the first dispatcher
    let again = logger::init(&config).unwrap();
    assert_eq!(again, installed);
}
