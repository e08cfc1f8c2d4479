use super::settings::{Settings, StoreBackend};
use super::{load_config, load_config_from};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 1883);
    assert_eq!(settings.server.connect_timeout_secs, 10);
    assert_eq!(settings.broker.max_qos, 2);
    assert!(settings.broker.assign_client_ids);
    assert_eq!(settings.broker.client_id_prefix, "auto-");
    assert!(settings.broker.allow_anonymous);
    assert_eq!(settings.persistence.backend, StoreBackend::Memory);
    assert!(settings.auth.users.is_empty());
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    temp_env::with_vars_unset(["MQTT_SERVER__PORT", "MQTT_BROKER__MAX_QOS"], || {
        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.server.port, 1883);
        assert_eq!(cfg.broker.max_qos, 2);
    });
}

#[test]
#[serial]
fn load_config_from_env_overrides_defaults() {
    temp_env::with_vars(
        [
            ("MQTT_SERVER__PORT", Some("9001")),
            ("MQTT_BROKER__MAX_QOS", Some("1")),
            ("MQTT_BROKER__ALLOW_ANONYMOUS", Some("false")),
            ("MQTT_PERSISTENCE__BACKEND", Some("sled")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 9001);
            assert_eq!(cfg.server.host, "127.0.0.1");
            assert_eq!(cfg.broker.max_qos, 1);
            assert!(!cfg.broker.allow_anonymous);
            assert_eq!(cfg.persistence.backend, StoreBackend::Sled);
        },
    );
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("broker.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 8883

        [broker]
        client_id_prefix = "gen-"
        assign_client_ids = false

        [persistence]
        backend = "sled"
        path = "/var/lib/broker"

        [auth.users]
        alice = "secret"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str()).expect("load_config_from failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 8883);
    assert_eq!(cfg.server.connect_timeout_secs, 10);
    assert_eq!(cfg.broker.client_id_prefix, "gen-");
    assert!(!cfg.broker.assign_client_ids);
    assert_eq!(cfg.broker.max_qos, 2);
    assert_eq!(cfg.persistence.backend, StoreBackend::Sled);
    assert_eq!(cfg.persistence.path, "/var/lib/broker");
    assert_eq!(cfg.auth.users.get("alice").map(String::as_str), Some("secret"));
}

#[test]
fn load_config_from_missing_file_fails() {
    assert!(load_config_from(Some("/nonexistent/broker.toml")).is_err());
}
