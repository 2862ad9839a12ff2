//! Producer with confirmed delivery
//!
//! [`Producer::must_produce`] submits a message and waits for the broker to
//! confirm it, returning the offset it was written at. Each call gets its own
//! delivery channel, so concurrent calls never see each other's reports.

use async_trait::async_trait;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn, Instrument};

use super::api::rdkafka::RdKafkaProducer;
use super::api::{ApiMessage, ProducerApi};
use super::delivery::{
    check_delivery_event, DeliveryError, DeliveryFailure, ProducerEventHandler,
};
use super::encryption::{EncryptionHandler, NoEncryption};
use super::{Defaults, KafkaConfig};
use crate::error::{Error, Result};
use crate::models::{Message, Offset};

/// Something that can produce a message and confirm its delivery
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn must_produce(&self, message: Message) -> Result<Offset>;
}

/// Lifecycle of a [`Producer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Initialising,
    Connected,
    Closed,
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProducerState::Initialising => "Initialising",
            ProducerState::Connected => "Connected",
            ProducerState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

pub struct Producer {
    config: KafkaConfig,
    api: Box<dyn ProducerApi>,
    encryption_handler: Option<Arc<dyn EncryptionHandler>>,
    defaults: Defaults,
    state: Mutex<ProducerState>,
}

impl Producer {
    /// Create a producer over the given broker client
    pub fn new(config: KafkaConfig, api: Box<dyn ProducerApi>) -> Self {
        Self {
            config,
            api,
            encryption_handler: None,
            defaults: Defaults::default(),
            state: Mutex::new(ProducerState::Initialising),
        }
    }

    /// Create a producer over librdkafka
    pub fn with_rdkafka(config: KafkaConfig) -> Self {
        Self::new(config, Box::new(RdKafkaProducer::new()))
    }

    pub fn with_encryption_handler(mut self, handler: impl EncryptionHandler + 'static) -> Self {
        self.encryption_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn state(&self) -> ProducerState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, ProducerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the broker session
    pub fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if state != ProducerState::Initialising {
            return Err(Error::invalid_state("Connect", state));
        }

        let encryption = self
            .encryption_handler
            .clone()
            .or_else(|| self.defaults.encryption_handler.clone())
            .unwrap_or_else(|| Arc::new(NoEncryption));
        self.encryption_handler = Some(encryption);

        self.api
            .create(&self.config.build_producer_config())
            .map_err(|e| Error::api("Create", e))?;

        *self.lock_state() = ProducerState::Connected;
        info!(brokers = %self.config.brokers, "producer connected");
        Ok(())
    }

    /// Validate and encrypt a message ready for submission
    fn prepare(&self, mut message: Message) -> Result<ApiMessage> {
        if self.state() != ProducerState::Connected {
            return Err(Error::NotConnected);
        }
        if message.topic.is_empty() {
            return Err(Error::NoTopicId);
        }
        if let Some(encryption) = &self.encryption_handler {
            encryption.encrypt(&mut message).map_err(Error::encryption)?;
        }
        Ok(ApiMessage::from(&message))
    }

    /// Produce a message and wait for the broker to confirm it
    ///
    /// There is no timeout here; the client gives up on a message after its
    /// configured `message.timeout.ms` and reports that as a failure.
    pub async fn must_produce(&self, message: Message) -> Result<Offset> {
        let span = crate::produce_span!(message.topic);
        async move {
            let api_message = self.prepare(message)?;

            let (tx, rx) = oneshot::channel();
            self.api
                .produce(api_message, Some(tx))
                .map_err(|e| Error::api("Produce", e))?;

            let event = rx
                .await
                .map_err(|_| DeliveryFailure::new(DeliveryError::ChannelClosed))?;
            let (_, offset) = check_delivery_event(event)?;

            tracing::Span::current().record("offset", offset.offset);
            tracing::Span::current().record("partition", offset.partition);
            info!(offset = %offset, "message produced");
            Ok::<_, Error>(offset)
        }
        .instrument(span)
        .await
    }

    /// Submit a message without waiting for it to be confirmed
    ///
    /// The delivery report arrives on the shared event stream; see
    /// [`handle_events`](Self::handle_events).
    pub fn produce(&self, message: Message) -> Result<()> {
        let api_message = self.prepare(message)?;
        self.api
            .produce(api_message, None)
            .map_err(|e| Error::api("Produce", e))
    }

    /// Wait up to `timeout` for outstanding deliveries
    ///
    /// Returns the number of messages still awaiting delivery.
    pub fn flush(&self, timeout: Duration) -> usize {
        let timeout = if timeout < Duration::from_millis(1) {
            Duration::ZERO
        } else {
            timeout
        };
        self.api.flush(timeout)
    }

    /// Dispatch events from the shared event stream to `handler`
    ///
    /// Runs until the stream ends or a callback breaks, then closes the
    /// producer. The stream ends when the producer is closed from elsewhere,
    /// e.g. by another task holding the producer in an `Arc`.
    pub async fn handle_events<H: ProducerEventHandler>(&self, handler: &mut H) -> Result<()> {
        let state = self.state();
        if state != ProducerState::Connected {
            return Err(Error::invalid_state("HandleEvents", state));
        }
        let Some(mut events) = self.api.take_events() else {
            return Err(Error::invalid_state("HandleEvents", state));
        };

        while let Some(event) = events.recv().await {
            let flow = match check_delivery_event(event) {
                Ok((message, offset)) => {
                    handler.on_message_delivered(&message, &offset);
                    ControlFlow::Continue(())
                }
                Err(failure) => match (failure.message, failure.error) {
                    (Some(message), DeliveryError::Record(e)) => {
                        handler.on_message_error(&message, &e)
                    }
                    (_, DeliveryError::Client(e)) | (None, DeliveryError::Record(e)) => {
                        handler.on_producer_error(&e)
                    }
                    (_, DeliveryError::UnexpectedEvent(description)) => {
                        handler.on_unexpected_event(&description)
                    }
                    (_, DeliveryError::ChannelClosed) => ControlFlow::Continue(()),
                },
            };
            if flow.is_break() {
                debug!("event handler requested stop");
                break;
            }
        }

        self.close();
        Ok(())
    }

    /// Release the broker session, ending the shared event stream
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == ProducerState::Closed {
                return;
            }
            *state = ProducerState::Closed;
        }
        let remaining = self.api.flush(Duration::from_millis(500));
        if remaining > 0 {
            warn!(remaining, "producer closed with undelivered messages");
        }
        self.api.close();
        trace!("producer closed");
    }
}

#[async_trait]
impl MessageProducer for Producer {
    async fn must_produce(&self, message: Message) -> Result<Offset> {
        Producer::must_produce(self, message).await
    }
}
