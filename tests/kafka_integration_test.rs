//! Integration tests against a running Kafka broker

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use topicflow::kafka::{
    handler_fn, Consumer, KafkaConfig, LinearRetryPolicy, MessageHandler, MessageProducer,
    Producer, Reader, ReprocessMessage,
};
use topicflow::models::{Message, RETRY_NUM_HEADER};
use uuid::Uuid;

/// Test Kafka broker address
const TEST_KAFKA_BROKER: &str = "localhost:9092";

/// Create test topics for integration testing
async fn create_test_topics(topics: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let admin: AdminClient<DefaultClientContext> =
        ClientConfig::new().set("bootstrap.servers", TEST_KAFKA_BROKER).create()?;

    let new_topics: Vec<_> = topics
        .iter()
        .map(|topic| NewTopic::new(topic, 1, TopicReplication::Fixed(1)))
        .collect();

    let results = admin.create_topics(&new_topics, &AdminOptions::new()).await?;

    for result in results {
        match result {
            Ok(topic) => println!("Created topic: {}", topic),
            Err((topic, err)) => {
                // Ignore if topic already exists
                if !err.to_string().contains("already exists") {
                    return Err(format!("Failed to create topic {}: {}", topic, err).into());
                }
            },
        }
    }

    Ok(())
}

fn test_config() -> KafkaConfig {
    KafkaConfig {
        brokers: TEST_KAFKA_BROKER.to_string(),
        group_id: format!("topicflow-test-{}", Uuid::new_v4()),
        message_timeout_ms: 5000,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_must_produce_then_read_back() {
    let topic = format!("topicflow-produce-{}", Uuid::new_v4());
    create_test_topics(&[&topic]).await.expect("Failed to create topics");

    let mut producer = Producer::with_rdkafka(test_config());
    producer.connect().expect("Failed to connect producer");

    let mut message = Message::new(topic.clone(), "hello").with_key("k");
    message.set_header("trace-id", "abc123");
    let offset = producer.must_produce(message).await.expect("Failed to produce");
    assert_eq!(offset.topic, topic);
    assert_eq!(offset.offset, 0);
    producer.close();

    let mut reader = Reader::with_rdkafka(test_config(), vec![topic.clone()]);
    let messages = reader
        .read_all(Duration::from_secs(5))
        .await
        .expect("Failed to read topic");

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].value, b"hello");
    assert_eq!(messages[0].header("trace-id"), Some("abc123"));
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_failed_message_reaches_dead_letter_topic() {
    let suffix = Uuid::new_v4();
    let topic = format!("topicflow-orders-{suffix}");
    let retry_topic = format!("{topic}-retry");
    let dead_topic = format!("{topic}-dead");
    create_test_topics(&[&topic, &retry_topic, &dead_topic])
        .await
        .expect("Failed to create topics");

    let mut producer = Producer::with_rdkafka(test_config());
    producer.connect().expect("Failed to connect producer");
    producer
        .must_produce(Message::new(topic.clone(), "order-1"))
        .await
        .expect("Failed to produce");
    let producer: Arc<dyn MessageProducer> = Arc::new(producer);

    let mut consumer = Consumer::with_rdkafka(test_config())
        .stop_on_interrupt(false)
        .with_handler(
            &topic,
            MessageHandler::new(handler_fn(|_| async { anyhow::bail!("always fails") }))
                .with_retry_topic(&retry_topic)
                .with_dead_letter_topic(&dead_topic)
                .with_retry_policy(LinearRetryPolicy::new(Duration::ZERO, 1))
                .with_deferral_handler(ReprocessMessage::new(Duration::from_millis(10))),
        )
        .with_message_producer(producer);

    consumer.run().await.expect("Failed to start consumer");
    tokio::time::sleep(Duration::from_secs(15)).await;
    consumer.stop();
    consumer.wait().await;
    assert!(consumer.errors().is_empty(), "{:?}", consumer.errors());

    let mut reader = Reader::with_rdkafka(test_config(), vec![dead_topic]);
    let dead = reader
        .read_all(Duration::from_secs(5))
        .await
        .expect("Failed to read dead letters");

    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].value, b"order-1");
    assert_eq!(dead[0].header(RETRY_NUM_HEADER), Some("2"));
}
