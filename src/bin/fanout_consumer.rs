//! fanout-consumer: standalone broker consumer
//!
//! Subscribes to the given channels on the configured broker and prints every
//! delivered message to stdout as one JSON line.
//!
//! ## Configuration
//! - `fanout.yaml`, `--config <path>` or `FANOUT_CONFIG`
//! - `FANOUT__*` environment overrides (`FANOUT__BROKER__DRIVER=redis`)
//! - Command-line flags override both
//! - FANOUT_LOG: tracing filter (default: info)
//!
//! Exits non-zero when the broker cannot be reached at startup.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use fanout::bus::{connect_broker, BrokerError, BrokerKind};
use fanout::config::Config;
use fanout::connection::{Connection, MpscSink};
use fanout::consumer::{ConsumerLoop, ConsumerOptions, ShutdownSignal};
use fanout::dlq::default_dead_letter_topic;
use fanout::manager::Manager;
use fanout::utils::bootstrap::{connect_with_retry, init_tracing};

const STDOUT_CONNECTION: &str = "stdout";
const STDOUT_BUFFER: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "fanout-consumer", about = "Consume fanout channels from a broker")]
struct Args {
    /// Channels to consume, comma separated
    #[arg(long, value_delimiter = ',')]
    channels: Vec<String>,

    /// Messages taken per poll
    #[arg(long)]
    batch_size: Option<usize>,

    /// Poll timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop after this many messages
    #[arg(long)]
    max_messages: Option<u64>,

    /// Dead-letter failed messages (to `{topic_prefix}.dlq` unless configured)
    #[arg(long)]
    dlq_enabled: bool,

    /// Exit on the first empty poll
    #[arg(long)]
    stop_when_empty: bool,

    /// Broker driver: kafka, rabbitmq or redis
    #[arg(long)]
    driver: Option<BrokerKind>,

    /// Configuration file
    #[arg(long)]
    config: Option<String>,
}

impl Args {
    /// Layer flags over the loaded configuration.
    fn apply(&self, config: &mut Config) {
        let broker = config.broker.get_or_insert_with(Default::default);
        if let Some(driver) = self.driver {
            broker.driver = driver;
        }
        if self.dlq_enabled && broker.dead_letter_topic.is_none() {
            broker.dead_letter_topic = Some(default_dead_letter_topic(&broker.topic_prefix));
        }

        let consumer = &mut config.consumer;
        if !self.channels.is_empty() {
            consumer.channels = self.channels.clone();
        }
        if let Some(batch_size) = self.batch_size {
            consumer.batch_size = batch_size;
        }
        if let Some(timeout) = self.timeout {
            consumer.poll_timeout = Duration::from_millis(timeout);
        }
        if self.max_messages.is_some() {
            consumer.max_messages = self.max_messages;
        }
        if self.stop_when_empty {
            consumer.stop_when_empty = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let channels: Vec<String> = config
        .consumer
        .channels
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if channels.is_empty() {
        error!("No channels to consume; pass --channels or set consumer.channels");
        return Err("no channels configured".into());
    }

    let broker_config = config.broker.clone().unwrap_or_default();
    let broker = connect_with_retry(
        broker_config.driver.as_str(),
        broker_config.connect_attempts,
        || connect_broker(&broker_config),
        BrokerError::is_retryable,
    )
    .await?;

    let manager = Manager::new(Arc::clone(&broker));
    for channel in &channels {
        manager.listen(channel).await?;
    }

    let (sink, mut frames) = MpscSink::bounded(STDOUT_BUFFER);
    let stdout_connection =
        Arc::new(Connection::new(STDOUT_CONNECTION, Arc::new(sink)).with_user("fanout-consumer"));
    manager.connect(&stdout_connection).await;
    for channel in &channels {
        manager.subscribe(STDOUT_CONNECTION, channel).await?;
    }

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = frames.recv().await {
            let line = format!("{}\n", frame);
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = stdout.flush().await;
    });

    let shutdown = ShutdownSignal::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, finishing current batch");
                shutdown.trigger();
            }
        })
    };

    info!(
        driver = %broker_config.driver,
        channels = ?channels,
        "fanout-consumer started"
    );

    let consumer = ConsumerLoop::new(broker, ConsumerOptions::from(&config.consumer))
        .with_shutdown(shutdown);
    let result = consumer.run().await;

    ctrl_c.abort();
    let stats = manager.stats().await;
    manager.disconnect_connection(STDOUT_CONNECTION).await?;
    drop(stdout_connection);
    drop(manager);
    let _ = printer.await;

    let report = result?;
    info!(
        consumed = report.consumed,
        delivered = stats.delivered,
        dropped = stats.dropped_no_subscribers,
        reason = ?report.reason,
        "fanout-consumer finished"
    );
    Ok(())
}
