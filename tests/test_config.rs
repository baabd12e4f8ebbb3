use std::time::Duration;

use switchyard::config::Config;

// Environment variables are process-wide, so every env-dependent check
// lives in this one test.
#[test]
fn test_config_env_overrides() {
    unsafe {
        std::env::remove_var("LISTEN");
        std::env::remove_var("IDLE_TIMEOUT_SECS");
    }
    let cfg = Config::load();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.server.idle_timeout(), Duration::from_secs(5));

    unsafe {
        std::env::set_var("LISTEN", "0.0.0.0:3000");
        std::env::set_var("IDLE_TIMEOUT_SECS", "30");
    }
    let cfg = Config::load();
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:3000");
    assert_eq!(cfg.server.idle_timeout_secs, 30);

    unsafe {
        std::env::set_var("IDLE_TIMEOUT_SECS", "soon");
    }
    let cfg = Config::load();
    assert_eq!(cfg.server.idle_timeout_secs, 5);

    unsafe {
        std::env::remove_var("LISTEN");
        std::env::remove_var("IDLE_TIMEOUT_SECS");
    }
}

#[test]
fn test_config_clone() {
    let cfg1 = Config::default();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.server.listen_addr, cfg2.server.listen_addr);
}

#[test]
fn test_config_from_yaml() {
    let cfg = Config::from_yaml_str(
        "server:\n  listen_addr: \"0.0.0.0:9000\"\n  idle_timeout_secs: 0\n  max_requests_per_connection: 10\n",
    )
    .unwrap();

    assert_eq!(cfg.server.listen_addr, "0.0.0.0:9000");
    assert_eq!(cfg.server.idle_timeout(), Duration::ZERO);
    assert_eq!(cfg.server.max_requests_per_connection, 10);
    // Unset fields keep their defaults.
    assert_eq!(cfg.server.read_buffer_size, 4096);
}

#[test]
fn test_config_empty_yaml_is_default() {
    let cfg = Config::from_yaml_str("{}").unwrap();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
}

#[test]
fn test_config_rejects_bad_yaml() {
    assert!(Config::from_yaml_str("server: [1, 2").is_err());
    assert!(Config::from_yaml_str("server:\n  idle_timeout_secs: soon\n").is_err());
}

#[test]
fn test_config_connection_settings() {
    let cfg = Config::from_yaml_str(
        "server:\n  idle_timeout_secs: 7\n  max_header_bytes: 100\n  max_body_bytes: 50\n",
    )
    .unwrap();

    let settings = cfg.server.connection_settings();
    assert_eq!(settings.idle_timeout, Duration::from_secs(7));
    assert_eq!(settings.max_buffered_bytes, 150);
    assert_eq!(settings.max_requests, 1000);
    assert_eq!(settings.max_pipelined, 16);
}
