//! Test utilities for topicflow
//!
//! Mock collaborators and message builders shared by unit and integration
//! tests. The broker client mocks live in [`crate::kafka::api::mock`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::kafka::api::{ApiError, ApiMessage};
use crate::kafka::{
    handler_fn, ConsumerHandle, DeferOutcome, DeferralHandler, EncryptionHandler,
    MessageHandler, MessageProducer, RetryPolicy,
};
use crate::models::{Message, Offset};

/// A message as the broker would deliver it, read just now
pub fn api_message(topic: &str, partition: i32, offset: i64) -> ApiMessage {
    ApiMessage {
        topic: topic.to_string(),
        partition: Some(partition),
        offset: Some(offset),
        key: Some(b"key".to_vec()),
        value: Some(b"value".to_vec()),
        timestamp: Some(Utc::now()),
        headers: Vec::new(),
    }
}

/// A handler that always fails with `reason`
pub fn failing_handler(reason: &'static str) -> MessageHandler {
    MessageHandler::new(handler_fn(move |_| async move { Err::<(), _>(anyhow::anyhow!(reason)) }))
}

#[derive(Default)]
struct ProducerState {
    produced: Vec<Message>,
    offsets: HashMap<String, i64>,
    fail_next: bool,
}

/// Mock implementation of MessageProducer for testing
///
/// Every message is accepted at partition 0 with sequential offsets per topic.
#[derive(Clone, Default)]
pub struct MockMessageProducer {
    state: Arc<Mutex<ProducerState>>,
}

impl MockMessageProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call to `must_produce`
    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    /// Messages produced so far, oldest first
    pub fn produced(&self) -> Vec<Message> {
        self.state.lock().unwrap().produced.clone()
    }
}

#[async_trait]
impl MessageProducer for MockMessageProducer {
    async fn must_produce(&self, message: Message) -> Result<Offset> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next {
            state.fail_next = false;
            return Err(Error::api("Produce", ApiError::other("mock produce failure")));
        }
        if message.topic.is_empty() {
            return Err(Error::NoTopicId);
        }

        let next = state.offsets.entry(message.topic.clone()).or_insert(0);
        let offset = Offset::new(message.topic.clone(), 0, *next);
        *next += 1;
        state.produced.push(message);
        Ok(offset)
    }
}

/// Mock implementation of RetryPolicy for testing
#[derive(Debug, Clone)]
pub struct MockRetryPolicy {
    pub retry: bool,
    pub delay: Duration,
    calls: Arc<Mutex<usize>>,
}

impl MockRetryPolicy {
    pub fn new(retry: bool, delay: Duration) -> Self {
        Self {
            retry,
            delay,
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Number of times `should_retry` was asked
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl RetryPolicy for MockRetryPolicy {
    fn should_retry(&self, _message: &Message) -> bool {
        *self.calls.lock().unwrap() += 1;
        self.retry
    }

    fn retry_delay(&self, _message: &Message) -> Duration {
        self.delay
    }
}

impl fmt::Display for MockRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mock: retry={}", self.retry)
    }
}

/// Mock implementation of DeferralHandler for testing
///
/// Records every deferred message and returns a fixed outcome.
#[derive(Clone)]
pub struct MockDeferralHandler {
    outcome: DeferOutcome,
    deferred: Arc<Mutex<Vec<Message>>>,
}

impl MockDeferralHandler {
    pub fn new(outcome: DeferOutcome) -> Self {
        Self {
            outcome,
            deferred: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn deferred(&self) -> Vec<Message> {
        self.deferred.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeferralHandler for MockDeferralHandler {
    async fn defer(
        &self,
        _consumer: &mut dyn ConsumerHandle,
        message: &Message,
    ) -> Result<DeferOutcome> {
        self.deferred.lock().unwrap().push(message.clone());
        Ok(self.outcome)
    }
}

#[derive(Default)]
struct EncryptionState {
    encrypted: usize,
    decrypted: usize,
    fail_next: Option<String>,
}

/// Mock implementation of EncryptionHandler for testing
///
/// Counts calls and marks each message with an `encrypted` header.
#[derive(Clone, Default)]
pub struct MockEncryptionHandler {
    state: Arc<Mutex<EncryptionState>>,
}

impl MockEncryptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next encrypt or decrypt with `reason`
    pub fn fail_next(&self, reason: &str) {
        self.state.lock().unwrap().fail_next = Some(reason.to_string());
    }

    pub fn encrypted(&self) -> usize {
        self.state.lock().unwrap().encrypted
    }

    pub fn decrypted(&self) -> usize {
        self.state.lock().unwrap().decrypted
    }
}

impl EncryptionHandler for MockEncryptionHandler {
    fn decrypt(&self, message: &mut Message) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.fail_next.take() {
            anyhow::bail!(reason);
        }
        state.decrypted += 1;
        message.remove_header("encrypted");
        Ok(())
    }

    fn encrypt(&self, message: &mut Message) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.fail_next.take() {
            anyhow::bail!(reason);
        }
        state.encrypted += 1;
        message.set_header("encrypted", "true");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_message_producer() {
        let producer = MockMessageProducer::new();

        let offset = producer
            .must_produce(Message::new("orders", "v"))
            .await
            .unwrap();
        assert_eq!(offset, Offset::new("orders", 0, 0));

        producer.fail_next();
        assert!(producer
            .must_produce(Message::new("orders", "v"))
            .await
            .is_err());
        assert_eq!(producer.produced().len(), 1);
    }

    #[test]
    fn test_mock_encryption_handler() {
        let encryption = MockEncryptionHandler::new();
        let mut msg = Message::new("orders", "v");

        encryption.encrypt(&mut msg).unwrap();
        assert_eq!(msg.header("encrypted"), Some("true"));
        encryption.decrypt(&mut msg).unwrap();
        assert_eq!(msg.header("encrypted"), None);

        encryption.fail_next("no key");
        assert_eq!(
            encryption.decrypt(&mut msg).unwrap_err().to_string(),
            "no key"
        );
    }
}
