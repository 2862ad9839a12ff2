//! Kafka consumption and production with retries, deferral and dead letters
//!
//! This module provides:
//! - [`Consumer`], which dispatches messages to per-topic handlers and routes
//!   failures to retry or dead-letter topics
//! - [`Producer`], which produces messages and waits for their delivery
//! - [`Reader`], which reads every message currently on a set of topics
//! - Retry policies and deferral handlers that decide when a message is
//!   handled again

pub mod api;
mod config;
mod consumer;
mod deferral;
mod delivery;
mod encryption;
mod handler;
mod processor;
mod producer;
mod reader;
mod retry;

use std::fmt;
use std::sync::Arc;

pub use api::{ApiError, ApiMessage, DeliveryEvent, RebalanceEvent, RebalanceHandler};
pub use config::KafkaConfig;
pub use consumer::{Consumer, ConsumerState};
pub use deferral::{
    ConsumerHandle, DeferOutcome, DeferralHandler, ReprocessMessage, ReproduceMessage,
};
pub use delivery::{check_delivery_event, DeliveryError, DeliveryFailure, ProducerEventHandler};
pub use encryption::{EncryptionHandler, NoEncryption};
pub use handler::{handler_fn, Handle, HandlerFn, MessageHandler};
pub use producer::{MessageProducer, Producer, ProducerState};
pub use reader::{Reader, ReaderState};
pub use retry::{ExponentialBackoffRetryPolicy, LinearRetryPolicy, RetryPolicy, UNLIMITED_RETRIES};

/// Collaborators used by consumers, producers and readers that were not
/// given their own
#[derive(Clone)]
pub struct Defaults {
    pub encryption_handler: Option<Arc<dyn EncryptionHandler>>,
    pub message_producer: Option<Arc<dyn MessageProducer>>,
}

impl Defaults {
    /// No default collaborators at all
    pub fn none() -> Self {
        Self {
            encryption_handler: None,
            message_producer: None,
        }
    }

    pub fn with_encryption_handler(mut self, handler: impl EncryptionHandler + 'static) -> Self {
        self.encryption_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_message_producer(mut self, producer: Arc<dyn MessageProducer>) -> Self {
        self.message_producer = Some(producer);
        self
    }
}

/// Pass-through encryption and no producer
impl Default for Defaults {
    fn default() -> Self {
        Self {
            encryption_handler: Some(Arc::new(NoEncryption)),
            message_producer: None,
        }
    }
}

impl fmt::Debug for Defaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defaults")
            .field("encryption_handler", &self.encryption_handler.is_some())
            .field("message_producer", &self.message_producer.is_some())
            .finish()
    }
}
