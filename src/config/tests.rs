use super::settings::Settings;
use super::{PartialSettings, load_config};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.bus.queue, "queue1");
    assert_eq!(settings.bus.lock_duration_secs, 60);
    assert_eq!(settings.bus.max_auto_lock_renewal_secs, 300);
    assert_eq!(settings.bus.max_batch_size_bytes, 262_144);
    assert_eq!(settings.broker.max_delivery_count, 10);
    assert_eq!(settings.log.level, "info");
}

#[test]
fn test_merge_keeps_defaults_for_missing_sections() {
    let settings = Settings::merge(PartialSettings::default());
    assert_eq!(settings.bus.receive_wait_ms, 5000);
    assert_eq!(settings.persistence.path, "peeklock_db");
}

#[test]
#[serial]
fn load_config_from_env_overrides_defaults() {
    temp_env::with_vars(
        [
            ("PEEKLOCK_SERVER__PORT", Some("9100")),
            ("PEEKLOCK_BUS__QUEUE", Some("orders")),
            ("PEEKLOCK_BUS__LOCK_DURATION_SECS", Some("30")),
            ("PEEKLOCK_BROKER__MAX_DELIVERY_COUNT", Some("3")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.server.host, "127.0.0.1");
            assert_eq!(cfg.bus.queue, "orders");
            assert_eq!(cfg.bus.lock_duration_secs, 30);
            assert_eq!(cfg.bus.max_batch_size_bytes, 262_144);
            assert_eq!(cfg.broker.max_delivery_count, 3);
        },
    );
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // load_config reads config/default.toml relative to the working directory.
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [bus]
        queue = "invoices"
        max_batch_size_bytes = 1024

        [log]
        level = "debug"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    // restore cwd before asserting so a failure does not leak into other tests
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.bus.queue, "invoices");
    assert_eq!(cfg.bus.max_batch_size_bytes, 1024);
    assert_eq!(cfg.bus.lock_duration_secs, 60);
    assert_eq!(cfg.log.level, "debug");
}
