//! Delivery report classification
//!
//! Every event a producer client reports is sorted into a confirmed delivery
//! or a [`DeliveryFailure`] saying what went wrong.

use std::fmt;
use std::ops::ControlFlow;
use thiserror::Error;

use super::api::{ApiError, DeliveryEvent};
use crate::models::{Message, Offset};

/// Why a message was not confirmed as delivered
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    /// The broker reported an error for the record
    #[error("record not delivered: {0}")]
    Record(ApiError),

    /// The client reported an error not tied to a record
    #[error("client error: {0}")]
    Client(ApiError),

    /// The client reported something other than a delivery outcome
    #[error("unexpected delivery event: {0}")]
    UnexpectedEvent(String),

    /// The delivery report was lost
    #[error("delivery channel closed without a report")]
    ChannelClosed,
}

/// A failed delivery, with the message concerned when one is known
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub message: Option<Box<Message>>,
    pub offset: Option<Offset>,
    pub error: DeliveryError,
}

impl DeliveryFailure {
    pub fn new(error: DeliveryError) -> Self {
        Self {
            message: None,
            offset: None,
            error,
        }
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.offset {
            Some(offset) => write!(f, "delivery failed: {}: {}", offset, self.error),
            None => write!(f, "delivery failed: {}", self.error),
        }
    }
}

impl std::error::Error for DeliveryFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Classify a producer event
///
/// A delivery report without an error yields the written message and its
/// address; everything else is a failure.
pub fn check_delivery_event(
    event: DeliveryEvent,
) -> Result<(Message, Offset), DeliveryFailure> {
    match event {
        DeliveryEvent::Message { message, error } => {
            let offset = message.address();
            let message = Message::from(message);
            match error {
                None => Ok((message, offset)),
                Some(e) => Err(DeliveryFailure {
                    message: Some(Box::new(message)),
                    offset: Some(offset),
                    error: DeliveryError::Record(e),
                }),
            }
        }
        DeliveryEvent::Error(e) => Err(DeliveryFailure::new(DeliveryError::Client(e))),
        DeliveryEvent::Other(description) => Err(DeliveryFailure::new(
            DeliveryError::UnexpectedEvent(description),
        )),
    }
}

/// Callbacks for events read from a producer's shared event stream
///
/// Returning [`ControlFlow::Break`] stops event handling and closes the
/// producer.
pub trait ProducerEventHandler: Send {
    fn on_message_delivered(&mut self, message: &Message, offset: &Offset);

    fn on_message_error(&mut self, message: &Message, error: &ApiError) -> ControlFlow<()>;

    /// Client-level errors are usually transient; the client recovers by itself
    fn on_producer_error(&mut self, error: &ApiError) -> ControlFlow<()> {
        tracing::warn!(error = %error, "producer error");
        ControlFlow::Continue(())
    }

    fn on_unexpected_event(&mut self, description: &str) -> ControlFlow<()> {
        tracing::warn!(event = %description, "unexpected producer event");
        ControlFlow::Continue(())
    }
}
