//! Kafka configuration module

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kafka configuration settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct KafkaConfig {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_brokers")]
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    /// Consumer group ID
    #[serde(default = "default_group_id")]
    #[envconfig(from = "KAFKA_GROUP_ID", default = "topicflow-consumer")]
    pub group_id: String,

    /// Let the client commit offsets in the background instead of
    /// committing each handled message
    #[serde(default = "default_async_commit")]
    #[envconfig(from = "KAFKA_ASYNC_COMMIT", default = "false")]
    pub async_commit: bool,

    /// Where a group with no committed offset starts reading
    #[serde(default = "default_auto_offset_reset")]
    #[envconfig(from = "KAFKA_AUTO_OFFSET_RESET", default = "earliest")]
    pub auto_offset_reset: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "30000")]
    pub session_timeout_ms: u32,

    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    #[envconfig(from = "KAFKA_MAX_POLL_INTERVAL_MS", default = "300000")]
    pub max_poll_interval_ms: u32,

    /// Enable idempotent delivery for produced messages
    #[serde(default = "default_idempotent_producer")]
    #[envconfig(from = "KAFKA_IDEMPOTENT_PRODUCER", default = "true")]
    pub idempotent_producer: bool,

    /// How long the client keeps trying to deliver a produced message
    #[serde(default = "default_message_timeout")]
    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT_MS", default = "30000")]
    pub message_timeout_ms: u32,

    /// How long a consumer waits for a message before checking for shutdown
    #[serde(default = "default_read_timeout")]
    #[envconfig(from = "KAFKA_READ_TIMEOUT_MS", default = "100")]
    pub read_timeout_ms: u64,

    /// How long a seek may take when a deferred message is reprocessed
    #[serde(default = "default_seek_timeout")]
    #[envconfig(from = "KAFKA_SEEK_TIMEOUT_MS", default = "100")]
    pub seek_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            async_commit: default_async_commit(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
            idempotent_producer: default_idempotent_producer(),
            message_timeout_ms: default_message_timeout(),
            read_timeout_ms: default_read_timeout(),
            seek_timeout_ms: default_seek_timeout(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        <Self as envconfig::Envconfig>::init_from_env()
    }

    /// Get brokers as a vector
    pub fn brokers_list(&self) -> Vec<String> {
        self.brokers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms as u64)
    }

    /// Get read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Get seek timeout as Duration
    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    /// Build rdkafka consumer configuration
    pub fn build_consumer_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", self.brokers_list().join(","))
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", self.async_commit.to_string())
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set(
                "max.poll.interval.ms",
                self.max_poll_interval_ms.to_string(),
            )
            .set("enable.partition.eof", "false");

        config
    }

    /// Build rdkafka producer configuration
    ///
    /// Messages are sent one at a time without lingering so that each
    /// delivery report arrives as soon as the broker has the message.
    pub fn build_producer_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", self.brokers_list().join(","))
            .set("enable.idempotence", self.idempotent_producer.to_string())
            .set("batch.size", "1")
            .set("linger.ms", "0")
            .set("message.timeout.ms", self.message_timeout_ms.to_string());

        if self.idempotent_producer {
            config.set("acks", "all");
        }

        config
    }
}

// Default value functions
fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "topicflow-consumer".to_string()
}

fn default_async_commit() -> bool {
    false
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout() -> u32 {
    30000 // 30 seconds
}

fn default_max_poll_interval() -> u32 {
    300000 // 5 minutes
}

fn default_idempotent_producer() -> bool {
    true
}

fn default_message_timeout() -> u32 {
    30000
}

fn default_read_timeout() -> u64 {
    100
}

fn default_seek_timeout() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KafkaConfig::default();
        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.group_id, "topicflow-consumer");
        assert!(!config.async_commit);
        assert_eq!(config.read_timeout(), Duration::from_millis(100));
        assert_eq!(config.seek_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_brokers_list() {
        let config = KafkaConfig {
            brokers: "broker1:9092, broker2:9092,".to_string(),
            ..Default::default()
        };
        assert_eq!(config.brokers_list(), vec!["broker1:9092", "broker2:9092"]);
    }

    #[test]
    fn test_consumer_config_build() {
        let config = KafkaConfig {
            group_id: "orders-service".to_string(),
            async_commit: true,
            ..Default::default()
        };
        let client = config.build_consumer_config();

        assert_eq!(client.get("group.id"), Some("orders-service"));
        assert_eq!(client.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client.get("enable.auto.commit"), Some("true"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_producer_config_build() {
        let client = KafkaConfig::default().build_producer_config();

        assert_eq!(client.get("enable.idempotence"), Some("true"));
        assert_eq!(client.get("batch.size"), Some("1"));
        assert_eq!(client.get("linger.ms"), Some("0"));
        assert_eq!(client.get("acks"), Some("all"));
    }
}
