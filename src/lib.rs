//! topicflow
//!
//! Retry, deferral and dead-letter handling for Kafka consumers, and
//! confirmed-delivery production, on top of rdkafka.

pub mod config;
pub mod error;
pub mod kafka;
pub mod logging;
pub mod models;
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{ConfigurationErrorKind, Error, FatalHandlerError, Result, SharedError};

pub use kafka::{
    Consumer, ConsumerState, Defaults, KafkaConfig, MessageHandler, Producer, ProducerState,
    Reader,
};
pub use models::{CommitIntent, Message, Offset};
