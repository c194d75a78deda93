//! Tests for `src/config/mod.rs` — defaults, TOML parsing, and env
//! overrides.

use armitage::config::Config;
use armitage::message::Channel;

#[test]
fn defaults_match_the_documented_scheduling_contract() {
    let config = Config::default();

    assert_eq!(config.dispatch.max_retry_attempts, 3);
    assert_eq!(config.dispatch.retry_base_interval_secs, 60);
    assert_eq!(config.dispatch.concurrency, 10);
    assert_eq!(config.dispatch.queues.len(), 1);
    assert_eq!(config.dispatch.queues[0].name, "general");
    assert_eq!(config.dispatch.queues[0].interval_secs, 30);
    assert_eq!(config.dispatch.queues[0].batch_size, 100);
    assert!(config.dispatch.queues[0].channel.is_none());

    assert_eq!(config.sync.interval_secs, 300);
    assert!(config.sync.enabled);

    assert_eq!(config.webhook.port, 8085);
    assert_eq!(config.webhook.dedup_window_secs, 86_400);
}

#[test]
fn toml_queues_and_channels_parse() {
    let config: Config = toml::from_str(
        r#"
        [provider]
        base_url = "http://bridge.internal:3100"

        [[dispatch.queue]]
        name = "general"
        interval_secs = 30

        [[dispatch.queue]]
        name = "high-volume"
        interval_secs = 1
        batch_size = 500
        channel = "chat"
        "#,
    )
    .expect("config should parse");

    assert_eq!(config.provider.base_url, "http://bridge.internal:3100");
    assert_eq!(config.dispatch.queues.len(), 2);
    assert_eq!(config.dispatch.queues[1].name, "high-volume");
    assert_eq!(config.dispatch.queues[1].interval_secs, 1);
    assert_eq!(config.dispatch.queues[1].batch_size, 500);
    assert_eq!(config.dispatch.queues[1].channel, Some(Channel::Chat));
}

#[test]
fn env_overrides_take_precedence() {
    let mut config = Config::default();
    config.apply_overrides(|key| match key {
        "ARMITAGE_PROVIDER_URL" => Some("http://other:9000".to_owned()),
        "ARMITAGE_MAX_RETRY_ATTEMPTS" => Some("5".to_owned()),
        "ARMITAGE_RETRY_BASE_INTERVAL_SECS" => Some("30".to_owned()),
        "ARMITAGE_WEBHOOK_PORT" => Some("9091".to_owned()),
        "ARMITAGE_LOG_LEVEL" => Some("debug".to_owned()),
        _ => None,
    });

    assert_eq!(config.provider.base_url, "http://other:9000");
    assert_eq!(config.dispatch.max_retry_attempts, 5);
    assert_eq!(config.dispatch.retry_base_interval_secs, 30);
    assert_eq!(config.webhook.port, 9091);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn invalid_env_values_are_ignored() {
    let mut config = Config::default();
    config.apply_overrides(|key| match key {
        "ARMITAGE_MAX_RETRY_ATTEMPTS" => Some("many".to_owned()),
        "ARMITAGE_WEBHOOK_PORT" => Some("-1".to_owned()),
        _ => None,
    });

    assert_eq!(config.dispatch.max_retry_attempts, 3);
    assert_eq!(config.webhook.port, 8085);
}

#[test]
fn db_path_override_applies() {
    let mut config = Config::default();
    config.apply_overrides(|key| match key {
        "ARMITAGE_DB_PATH" => Some("/tmp/armitage-test.db".to_owned()),
        _ => None,
    });
    let paths = config.runtime_paths();
    assert_eq!(paths.db_path.to_string_lossy(), "/tmp/armitage-test.db");
    assert_eq!(paths.logs_dir.to_string_lossy(), "/tmp/logs");
}
