//! Read everything currently on a set of topics
//!
//! A [`Reader`] joins no consumer group of any consequence: it uses a random
//! group id, assigns every partition from the beginning and reads until
//! nothing more arrives. Useful for inspecting retry and dead-letter topics.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::api::rdkafka::RdKafkaConsumer;
use super::api::{ApiError, ConsumerApi};
use super::encryption::{EncryptionHandler, NoEncryption};
use super::{Defaults, KafkaConfig};
use crate::error::{ConfigurationErrorKind, Error, Result};
use crate::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Initialising,
    Initialised,
    Connected,
    Closed,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderState::Initialising => "Initialising",
            ReaderState::Initialised => "Initialised",
            ReaderState::Connected => "Connected",
            ReaderState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

pub struct Reader {
    config: KafkaConfig,
    topics: Vec<String>,
    api: Box<dyn ConsumerApi>,
    encryption_handler: Option<Arc<dyn EncryptionHandler>>,
    defaults: Defaults,
    state: ReaderState,
}

impl Reader {
    pub fn new(config: KafkaConfig, topics: Vec<String>, api: Box<dyn ConsumerApi>) -> Self {
        Self {
            config,
            topics,
            api,
            encryption_handler: None,
            defaults: Defaults::default(),
            state: ReaderState::Initialising,
        }
    }

    /// Create a reader over librdkafka
    pub fn with_rdkafka(config: KafkaConfig, topics: Vec<String>) -> Self {
        Self::new(config, topics, Box::new(RdKafkaConsumer::default()))
    }

    pub fn with_encryption_handler(mut self, handler: impl EncryptionHandler + 'static) -> Self {
        self.encryption_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Read every message on the topics, stopping once `timeout` passes
    /// without a new one
    ///
    /// Messages are returned decrypted, in the order they were read.
    pub async fn read_all(&mut self, timeout: Duration) -> Result<Vec<Message>> {
        if self.state != ReaderState::Initialising {
            return Err(Error::invalid_state("ReadAll", self.state));
        }
        if self.topics.is_empty() {
            return Err(Error::config(ConfigurationErrorKind::NoTopics));
        }
        let encryption = self
            .encryption_handler
            .clone()
            .or_else(|| self.defaults.encryption_handler.clone())
            .unwrap_or_else(|| Arc::new(NoEncryption));
        self.state = ReaderState::Initialised;

        let config = KafkaConfig {
            group_id: format!("reader-{}", Uuid::new_v4()),
            async_commit: false,
            ..self.config.clone()
        };
        self.api
            .create(&config.build_consumer_config())
            .map_err(|e| Error::api("Create", e))?;
        self.state = ReaderState::Connected;

        let result = self.read_assigned(timeout, encryption.as_ref()).await;

        if let Err(e) = self.api.assign(None) {
            debug!(error = %e, "reader unassign failed");
        }
        self.close()?;

        let messages = result?;
        info!(topics = ?self.topics, count = messages.len(), "topics read");
        Ok(messages)
    }

    async fn read_assigned(
        &mut self,
        timeout: Duration,
        encryption: &dyn EncryptionHandler,
    ) -> Result<Vec<Message>> {
        self.api
            .assign(Some(self.topics.as_slice()))
            .map_err(|e| Error::api("Assign", e))?;

        let mut messages = Vec::new();
        loop {
            let raw = match self.api.read_message(timeout).await {
                Ok(raw) => raw,
                Err(ApiError::Timeout) => break,
                Err(e) => return Err(Error::api("ReadMessage", e)),
            };
            let mut message = Message::from(raw);
            encryption.decrypt(&mut message).map_err(Error::encryption)?;
            messages.push(message);
        }
        Ok(messages)
    }

    fn close(&mut self) -> Result<()> {
        self.state = ReaderState::Closed;
        self.api.close().map_err(|e| Error::api("Close", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::api::mock::MockConsumerApi;
    use crate::test_utils::{api_message, MockEncryptionHandler};

    fn topics() -> Vec<String> {
        vec!["orders-dead".to_string()]
    }

    #[tokio::test]
    async fn test_read_all() {
        let api = MockConsumerApi::new()
            .with_messages([api_message("orders-dead", 0, 0), api_message("orders-dead", 1, 0)])
            .idle_when_drained();
        let mut reader = Reader::new(KafkaConfig::default(), topics(), Box::new(api.clone()));

        let messages = reader.read_all(Duration::from_millis(1)).await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].partition, Some(1));
        assert_eq!(reader.state(), ReaderState::Closed);
        assert!(api.is_closed());
        assert_eq!(api.assignments(), vec![Some(topics()), None]);

        let config = api.config().unwrap();
        assert!(config.get("group.id").unwrap().starts_with("reader-"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
    }

    #[tokio::test]
    async fn test_read_all_requires_topics() {
        let api = MockConsumerApi::new();
        let mut reader = Reader::new(KafkaConfig::default(), Vec::new(), Box::new(api.clone()));

        let err = reader.read_all(Duration::from_millis(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "configuration error: no topics");
        assert!(api.config().is_none());
    }

    #[tokio::test]
    async fn test_read_all_decrypts() {
        let api = MockConsumerApi::new()
            .with_messages([api_message("orders-dead", 0, 0)])
            .idle_when_drained();
        let encryption = MockEncryptionHandler::new();
        let mut reader = Reader::new(KafkaConfig::default(), topics(), Box::new(api))
            .with_encryption_handler(encryption.clone());

        reader.read_all(Duration::from_millis(1)).await.unwrap();
        assert_eq!(encryption.decrypted(), 1);
    }

    #[tokio::test]
    async fn test_assign_failure_still_closes() {
        let api = MockConsumerApi::new();
        api.fail("Assign", ApiError::other("unknown topic"));
        let mut reader = Reader::new(KafkaConfig::default(), topics(), Box::new(api.clone()));

        let err = reader.read_all(Duration::from_millis(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "api.Assign() error: unknown topic");
        assert!(api.is_closed());
    }

    #[tokio::test]
    async fn test_read_all_only_once() {
        let api = MockConsumerApi::new().idle_when_drained();
        let mut reader = Reader::new(KafkaConfig::default(), topics(), Box::new(api));

        reader.read_all(Duration::from_millis(1)).await.unwrap();
        let err = reader.read_all(Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { operation: "ReadAll", .. }));
    }
}
