//! Consume a topic with retries and a dead-letter topic
//!
//! Messages whose value is not valid JSON are retried three times with
//! exponential backoff and then dead-lettered. Stop with Ctrl-C.
//!
//! Run with: cargo run --example retry_pipeline

use std::sync::Arc;
use std::time::Duration;
use topicflow::kafka::{
    handler_fn, Consumer, Defaults, ExponentialBackoffRetryPolicy, MessageHandler,
    MessageProducer, Producer, ReproduceMessage,
};
use topicflow::{logging, Config, Message, Result};

const TOPIC: &str = "orders";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    config.validate()?;

    logging::init_tracing(&config.logging.log_level, &config.logging.environment)?;
    config.log_config();

    let mut producer = Producer::with_rdkafka(config.kafka.clone());
    producer.connect()?;
    let producer: Arc<dyn MessageProducer> = Arc::new(producer);

    let handler = MessageHandler::new(handler_fn(|msg: Message| async move {
        let order: serde_json::Value = serde_json::from_slice(&msg.value)?;
        tracing::info!(message = %msg.summary(), order = %order, "order received");
        Ok(())
    }))
    .with_retry_topic(format!("{TOPIC}-retry"))
    .with_dead_letter_topic(format!("{TOPIC}-dead"))
    .with_retry_policy(ExponentialBackoffRetryPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(30),
        3,
    ))
    .with_deferral_handler(ReproduceMessage::new(Duration::from_millis(50)));

    let mut consumer = Consumer::with_rdkafka(config.kafka.clone())
        .with_handler(TOPIC, handler)
        .with_defaults(Defaults::default().with_message_producer(producer))
        .on_rebalance(|event, offsets| {
            tracing::info!(event = %event, partitions = offsets.len(), "rebalance");
            Ok(())
        });

    consumer.run().await?;
    consumer.wait().await;

    for err in consumer.errors() {
        tracing::error!(error = %err, "consumer error");
    }
    tracing::info!(state = %consumer.state(), "retry pipeline stopped");
    Ok(())
}
