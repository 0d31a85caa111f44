use turbomq::config::load_config;
use turbomq::Config;

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("turbomq.toml").expect("failed to load config");

    assert_eq!(cfg.server.bind_addr, "127.0.0.1:33444");
    assert_eq!(cfg.server.workers, Some(8));
    assert_eq!(cfg.server.max_frame_len, 16 * 1024 * 1024);
    assert_eq!(cfg.queues.max_depth, Some(100_000));
    assert_eq!(cfg.worker_count(), 8);
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_config("does-not-exist.toml").unwrap_err();
    assert!(matches!(err, turbomq::config::ConfigError::Io(_)));
}
