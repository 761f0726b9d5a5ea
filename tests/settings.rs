//! Reading settings from a `config::Config`.

use config::Config;
use nbconn::{Error, Settings, TlsStart};
use std::time::Duration;

#[test]
fn missing_keys_use_defaults() {
    let config = Config::builder().build().unwrap();
    let settings = Settings::from_config(&config).unwrap();

    assert_eq!(settings.dispatcher_pool_size, 2);
    assert_eq!(settings.worker_pool_size, 4);
    assert_eq!(settings.read_buffer_preallocation_size, 65536);
    assert_eq!(settings.idle_timeout, None);
    assert_eq!(settings.tls_start, None);
}

#[test]
fn namespaced_keys_take_precedence() {
    let config = Config::builder()
        .set_override("dispatcher_pool_size", 3)
        .unwrap()
        .set_override("edge.dispatcher_pool_size", 5)
        .unwrap()
        .set_override("worker_pool_size", 7)
        .unwrap()
        .set_override("edge.idle_timeout_ms", 250)
        .unwrap()
        .set_override("edge.tls_start", "on_demand")
        .unwrap()
        .build()
        .unwrap();

    let settings = Settings::from_config_named(&config, "edge").unwrap();
    assert_eq!(settings.name, "edge");
    assert_eq!(settings.dispatcher_pool_size, 5);
    assert_eq!(settings.worker_pool_size, 7);
    assert_eq!(settings.idle_timeout, Some(Duration::from_millis(250)));
    assert_eq!(settings.tls_start, Some(TlsStart::OnDemand));

    let plain = Settings::from_config(&config).unwrap();
    assert_eq!(plain.dispatcher_pool_size, 3);
    assert_eq!(plain.idle_timeout, None);
}

#[test]
fn pool_sizes_are_at_least_one() {
    let config = Config::builder()
        .set_override("dispatcher_pool_size", 0)
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(Settings::from_config(&config).unwrap().dispatcher_pool_size, 1);
}

#[test]
fn invalid_values_are_reported() {
    let config = Config::builder()
        .set_override("tls_start", "lazy")
        .unwrap()
        .build()
        .unwrap();
    assert!(matches!(
        Settings::from_config(&config),
        Err(Error::InvalidTlsStartMode { .. })
    ));

    let config = Config::builder()
        .set_override("worker_pool_size", "many")
        .unwrap()
        .build()
        .unwrap();
    assert!(matches!(Settings::from_config(&config), Err(Error::Config(_))));
}
