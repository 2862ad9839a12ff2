//! Deferral handlers
//!
//! A message carrying a deferral header that has not yet expired is passed
//! to a [`DeferralHandler`] instead of its message handler. The handler
//! either puts the message back to be read again later or produces a fresh
//! copy of it and lets the original be committed.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::models::{Message, Offset};

/// What the consumer should do with a deferred message once it was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferOutcome {
    /// The message was dealt with; commit it
    Commit,
    /// The consumer was repositioned to read the message again; do not commit
    Reprocess,
}

/// The parts of a running consumer available to a deferral handler
#[async_trait]
pub trait ConsumerHandle: Send {
    /// Reposition the consumer so the message at `offset` is read next
    fn seek(&mut self, offset: &Offset) -> Result<()>;

    /// Produce a message using the consumer's message producer
    async fn must_produce(&mut self, message: Message) -> Result<Offset>;
}

#[async_trait]
pub trait DeferralHandler: Send + Sync {
    async fn defer(
        &self,
        consumer: &mut dyn ConsumerHandle,
        message: &Message,
    ) -> Result<DeferOutcome>;

    /// True if deferring produces through the consumer's message producer
    fn needs_producer(&self) -> bool {
        false
    }
}

/// Wait, then seek back to the message so that it is read again
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReprocessMessage {
    pub delay: Duration,
}

impl ReprocessMessage {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl DeferralHandler for ReprocessMessage {
    async fn defer(
        &self,
        consumer: &mut dyn ConsumerHandle,
        message: &Message,
    ) -> Result<DeferOutcome> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let offset = Offset::new(
            message.topic.clone(),
            message.partition.unwrap_or(-1),
            message.offset.unwrap_or(-1),
        );
        consumer.seek(&offset)?;

        debug!(offset = %offset, "deferred message will be read again");
        Ok(DeferOutcome::Reprocess)
    }
}

/// Wait, then produce a copy of the message to its own topic
///
/// The copy is deferred for whatever remains of the original deferral, so a
/// message keeps cycling through the topic until its deferral has elapsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReproduceMessage {
    pub delay: Duration,
}

impl ReproduceMessage {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl DeferralHandler for ReproduceMessage {
    async fn defer(
        &self,
        consumer: &mut dyn ConsumerHandle,
        message: &Message,
    ) -> Result<DeferOutcome> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut deferred = message.new_copy();
        deferred.topic = message.topic.clone();

        let age = message.age.unwrap_or_default();
        if let Some(remaining) = message
            .deferral()
            .and_then(|d| d.checked_sub(age))
            .filter(|d| !d.is_zero())
        {
            deferred.defer_for(remaining);
        }

        let offset = consumer.must_produce(deferred).await?;
        debug!(offset = %offset, "deferred message reproduced");
        Ok(DeferOutcome::Commit)
    }

    fn needs_producer(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kafka::api::ApiError;
    use crate::models::DEFERRAL_HEADER;

    #[derive(Default)]
    struct RecordingConsumer {
        seeks: Vec<Offset>,
        produced: Vec<Message>,
        fail_seek: bool,
        fail_produce: bool,
    }

    #[async_trait]
    impl ConsumerHandle for RecordingConsumer {
        fn seek(&mut self, offset: &Offset) -> Result<()> {
            if self.fail_seek {
                return Err(Error::api("Seek", ApiError::other("seek failed")));
            }
            self.seeks.push(offset.clone());
            Ok(())
        }

        async fn must_produce(&mut self, message: Message) -> Result<Offset> {
            if self.fail_produce {
                return Err(Error::NotConnected);
            }
            let offset = Offset::new(message.topic.clone(), 0, 7);
            self.produced.push(message);
            Ok(offset)
        }
    }

    fn deferred_message(deferral: Duration, age: Duration) -> Message {
        let mut msg = Message::new("orders", "v");
        msg.partition = Some(1);
        msg.offset = Some(10);
        msg.age = Some(age);
        msg.defer_for(deferral);
        msg
    }

    #[tokio::test]
    async fn test_reprocess_seeks_to_message() {
        let mut consumer = RecordingConsumer::default();
        let msg = deferred_message(Duration::from_secs(2), Duration::from_secs(1));

        let outcome = ReprocessMessage::default()
            .defer(&mut consumer, &msg)
            .await
            .unwrap();

        assert_eq!(outcome, DeferOutcome::Reprocess);
        assert_eq!(consumer.seeks, vec![Offset::new("orders", 1, 10)]);
    }

    #[tokio::test]
    async fn test_reprocess_seek_failure() {
        let mut consumer = RecordingConsumer {
            fail_seek: true,
            ..Default::default()
        };
        let msg = deferred_message(Duration::from_secs(2), Duration::from_secs(1));

        let err = ReprocessMessage::default()
            .defer(&mut consumer, &msg)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Api { operation: "Seek", .. }));
    }

    #[tokio::test]
    async fn test_reproduce_defers_for_remaining_time() {
        let mut consumer = RecordingConsumer::default();
        let msg = deferred_message(Duration::from_secs(2), Duration::from_secs(1));

        let outcome = ReproduceMessage::default()
            .defer(&mut consumer, &msg)
            .await
            .unwrap();

        assert_eq!(outcome, DeferOutcome::Commit);
        let produced = &consumer.produced;
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].topic, "orders");
        assert_eq!(produced[0].header(DEFERRAL_HEADER), Some("1s"));
        assert_eq!(produced[0].offset, None);
    }

    #[tokio::test]
    async fn test_reproduce_elapsed_deferral_is_dropped() {
        let mut consumer = RecordingConsumer::default();
        let msg = deferred_message(Duration::from_secs(2), Duration::from_secs(3));

        ReproduceMessage::default()
            .defer(&mut consumer, &msg)
            .await
            .unwrap();

        let produced = &consumer.produced;
        assert_eq!(produced[0].header(DEFERRAL_HEADER), None);
    }

    #[tokio::test]
    async fn test_reproduce_returns_producer_error() {
        let mut consumer = RecordingConsumer {
            fail_produce: true,
            ..Default::default()
        };
        let msg = deferred_message(Duration::from_secs(2), Duration::from_secs(1));

        let err = ReproduceMessage::default()
            .defer(&mut consumer, &msg)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotConnected));
    }
}
