//! Broker client interfaces
//!
//! The consumer, producer and reader engines talk to the broker only through
//! [`ConsumerApi`] and [`ProducerApi`]. [`rdkafka`](self::rdkafka) provides
//! implementations over librdkafka and [`mock`] provides scripted in-memory
//! implementations for tests.

pub mod mock;
pub mod rdkafka;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::rdkafka::error::KafkaError;
use ::rdkafka::ClientConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::models::{CommitIntent, Message, Offset};

/// Errors reported by a broker client
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Nothing arrived within the read timeout
    #[error("timed out")]
    Timeout,

    /// The client session has not been created, or has been closed
    #[error("client not created")]
    NotCreated,

    #[error(transparent)]
    Kafka(#[from] KafkaError),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn other<S: Into<String>>(msg: S) -> Self {
        ApiError::Other(msg.into())
    }
}

/// A message as exchanged with the broker client
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiMessage {
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ApiMessage {
    /// The address of the message; unassigned fields read as -1
    pub fn address(&self) -> Offset {
        Offset::new(
            self.topic.clone(),
            self.partition.unwrap_or(-1),
            self.offset.unwrap_or(-1),
        )
    }
}

impl From<ApiMessage> for Message {
    fn from(api: ApiMessage) -> Self {
        let mut msg = Message::new(api.topic, api.value.unwrap_or_default());
        msg.key = api.key.unwrap_or_default();
        msg.partition = api.partition;
        msg.offset = api.offset;
        msg.timestamp = api.timestamp;
        msg.age = api
            .timestamp
            .map(|ts| (Utc::now() - ts).to_std().unwrap_or_default());
        for (key, value) in api.headers {
            msg.set_raw_header(key, value);
        }
        msg
    }
}

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        Self {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            key: (!msg.key.is_empty()).then(|| msg.key.clone()),
            value: Some(msg.value.clone()),
            timestamp: msg.timestamp,
            headers: msg
                .raw_headers()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        }
    }
}

/// A report from the producer side of a broker client
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// A delivery report for a message, with the error if it was not written
    Message {
        message: ApiMessage,
        error: Option<ApiError>,
    },
    /// A client-level error not tied to any message
    Error(ApiError),
    /// Anything else the client emits
    Other(String),
}

/// Partition assignment changes reported during a group rebalance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceEvent {
    AssignedPartitions,
    RevokedPartitions,
}

impl fmt::Display for RebalanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceEvent::AssignedPartitions => f.write_str("AssignedPartitions"),
            RebalanceEvent::RevokedPartitions => f.write_str("RevokedPartitions"),
        }
    }
}

/// Callback invoked when partitions are assigned to or revoked from a consumer
pub type RebalanceHandler =
    Arc<dyn Fn(RebalanceEvent, &[Offset]) -> anyhow::Result<()> + Send + Sync>;

/// Consumer side of a broker client
#[async_trait]
pub trait ConsumerApi: Send {
    /// Create the client session
    fn create(&mut self, config: &ClientConfig) -> Result<(), ApiError>;

    /// Join the group for the given topics
    fn subscribe(
        &mut self,
        topics: &[String],
        on_rebalance: Option<RebalanceHandler>,
    ) -> Result<(), ApiError>;

    /// Manually assign every partition of `topics` from the beginning;
    /// `None` removes the current assignment
    fn assign(&mut self, topics: Option<&[String]>) -> Result<(), ApiError>;

    /// Wait up to `timeout` for the next message
    async fn read_message(&mut self, timeout: Duration) -> Result<ApiMessage, ApiError>;

    /// Reposition the consumer so the message at `offset` is read next
    fn seek(&mut self, offset: &Offset, timeout: Duration) -> Result<(), ApiError>;

    fn commit(&mut self, offset: &Offset, intent: CommitIntent) -> Result<(), ApiError>;

    /// Leave the group and release the client session
    fn close(&mut self) -> Result<(), ApiError>;
}

/// Producer side of a broker client
pub trait ProducerApi: Send + Sync {
    fn create(&mut self, config: &ClientConfig) -> Result<(), ApiError>;

    /// Submit a message for delivery
    ///
    /// The delivery report is sent to `delivery` when one is given, and to
    /// the shared event stream otherwise.
    fn produce(
        &self,
        message: ApiMessage,
        delivery: Option<oneshot::Sender<DeliveryEvent>>,
    ) -> Result<(), ApiError>;

    /// Wait up to `timeout` for outstanding deliveries, returning how many remain
    fn flush(&self, timeout: Duration) -> usize;

    /// Take the shared event stream; only the first call returns it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeliveryEvent>>;

    /// Release the client and end the shared event stream
    ///
    /// The stream ends once every delivery report still in flight has been
    /// sent on it.
    fn close(&self);
}
