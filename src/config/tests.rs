use super::*;
use crate::bus::{BrokerKind, CommitMode, TopicMapping};
use serial_test::serial;
use std::io::Write;

fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn clear_env() {
    for key in [
        CONFIG_ENV_VAR,
        "FANOUT__BROKER__DRIVER",
        "FANOUT__BROKER__ENDPOINTS",
        "FANOUT__CONSUMER__CHANNELS",
        "FANOUT__CONSUMER__BATCH_SIZE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn test_config_default() {
    let config = Config::default();
    assert!(config.broker.is_none());
    assert_eq!(config.consumer.batch_size, 100);
    assert_eq!(config.consumer.poll_timeout, Duration::from_millis(1000));
    assert!(config.consumer.channels.is_empty());
    assert!(!config.consumer.stop_when_empty);
}

#[test]
fn test_broker_config_default() {
    let broker = BrokerConfig::default();
    assert_eq!(broker.driver, BrokerKind::Kafka);
    assert_eq!(broker.group_id, "fanout");
    assert_eq!(broker.topic_mapping, TopicMapping::Direct);
    assert_eq!(broker.commit_mode, CommitMode::Manual);
    assert_eq!(broker.producer.buffer_size, 100);
    assert!(broker.dead_letter_topic.is_none());
    assert_eq!(broker.endpoints_or_default(), vec!["localhost:9092".to_string()]);
}

#[test]
fn test_endpoints_default_follows_driver() {
    let broker = BrokerConfig {
        driver: BrokerKind::Redis,
        ..Default::default()
    };
    assert_eq!(broker.endpoints_or_default(), vec!["redis://localhost:6379".to_string()]);

    let broker = BrokerConfig {
        endpoints: vec!["a:9092".to_string(), "b:9092".to_string()],
        ..Default::default()
    };
    assert_eq!(broker.endpoints_or_default().len(), 2);
}

#[test]
#[serial]
fn test_load_from_file() {
    clear_env();
    let file = yaml_file(
        r#"
broker:
  driver: rabbitmq
  endpoints: ["amqp://mq:5672"]
  group_id: notifier
  topic_mapping: grouped
  commit_mode: auto
  prefetch: 10
  dead_letter_topic: fanout.dlq
  reconnect_delay_ms: 250
  producer:
    buffer_size: 500
    linger_ms: 20
    compression: zstd
  handler_retry:
    max_retries: 1
    base_delay_ms: 5
consumer:
  channels: [orders, users]
  batch_size: 10
  poll_timeout_ms: 250
  max_messages: 1000
  stop_when_empty: true
"#,
    );

    let config = Config::load(file.path().to_str()).unwrap();

    let broker = config.broker.unwrap();
    assert_eq!(broker.driver, BrokerKind::RabbitMq);
    assert_eq!(broker.endpoints, vec!["amqp://mq:5672".to_string()]);
    assert_eq!(broker.group_id, "notifier");
    assert_eq!(broker.topic_mapping, TopicMapping::Grouped);
    assert_eq!(broker.commit_mode, CommitMode::Auto);
    assert_eq!(broker.prefetch, 10);
    assert_eq!(broker.dead_letter_topic.as_deref(), Some("fanout.dlq"));
    assert_eq!(broker.reconnect_delay, Duration::from_millis(250));
    assert_eq!(broker.producer.buffer_size, 500);
    assert_eq!(broker.producer.linger, Duration::from_millis(20));
    assert_eq!(broker.producer.compression, CompressionCodec::Zstd);
    assert_eq!(broker.handler_retry.max_retries, 1);
    assert_eq!(broker.handler_retry.base_delay, Duration::from_millis(5));

    assert_eq!(config.consumer.channels, vec!["orders", "users"]);
    assert_eq!(config.consumer.batch_size, 10);
    assert_eq!(config.consumer.poll_timeout, Duration::from_millis(250));
    assert_eq!(config.consumer.max_messages, Some(1000));
    assert!(config.consumer.stop_when_empty);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    clear_env();
    let file = yaml_file(
        r#"
broker:
  driver: kafka
consumer:
  batch_size: 10
"#,
    );
    std::env::set_var("FANOUT__BROKER__DRIVER", "redis");
    std::env::set_var("FANOUT__CONSUMER__CHANNELS", "alerts,metrics");
    std::env::set_var("FANOUT__CONSUMER__BATCH_SIZE", "25");

    let result = Config::load(file.path().to_str());
    clear_env();
    let config = result.unwrap();

    assert_eq!(config.broker.unwrap().driver, BrokerKind::Redis);
    assert_eq!(config.consumer.channels, vec!["alerts", "metrics"]);
    assert_eq!(config.consumer.batch_size, 25);
}

#[test]
#[serial]
fn test_config_env_var_names_file() {
    clear_env();
    let file = yaml_file("consumer:\n  channels: [news]\n");
    std::env::set_var(CONFIG_ENV_VAR, file.path());

    let result = Config::load(None);
    clear_env();

    assert_eq!(result.unwrap().consumer.channels, vec!["news"]);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_error() {
    clear_env();
    let result = Config::load(Some("/nonexistent/fanout-test.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_zero_batch_size_rejected() {
    clear_env();
    let file = yaml_file("consumer:\n  batch_size: 0\n");

    let result = Config::load(file.path().to_str());

    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_empty_group_rejected() {
    let config = Config {
        broker: Some(BrokerConfig {
            group_id: " ".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}
