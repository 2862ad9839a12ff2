//! Error handling module for topicflow
//!
//! A single [`Error`] type covers configuration, broker-client, handler and
//! producer failures. It is `Clone` so a consumer can both return an error and
//! record it in its error list; errors raised by application code arrive as
//! [`anyhow::Error`] and are held in a shared [`SharedError`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::kafka::api::ApiError;
use crate::kafka::DeliveryFailure;

/// Result type alias for topicflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for topicflow
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A consumer, producer or reader is missing something it needs
    #[error("{}configuration error: {kind}", .topic.as_ref().map(|t| format!("{} ", t)).unwrap_or_default())]
    Configuration {
        topic: Option<String>,
        kind: ConfigurationErrorKind,
    },

    /// The broker client reported a failure
    #[error("api.{operation}() error: {source}")]
    Api {
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    /// A message could not be encrypted or decrypted
    #[error("encryption handler error: {0}")]
    Encryption(#[source] SharedError),

    /// A message handler returned an error
    #[error("handler error: {0}")]
    Handler(#[source] SharedError),

    /// A retry, dead-letter or deferred message could not be produced
    #[error("producer error: {0}")]
    Producer(#[source] Box<Error>),

    /// The broker did not confirm delivery of a message
    #[error(transparent)]
    Delivery(#[from] DeliveryFailure),

    /// An operation was attempted in a lifecycle state that does not allow it
    #[error("operation {operation}() invalid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A message was produced before the producer connected
    #[error("producer is not connected")]
    NotConnected,

    /// A message was produced without a topic
    #[error("message has no topic")]
    NoTopicId,
}

/// What a configuration error is about
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationErrorKind {
    #[error("no message handlers")]
    NoMessageHandlers,
    #[error("no handler for topic")]
    NoHandlerForTopic,
    #[error("no retry policy")]
    NoRetryPolicy,
    #[error("no deferral handler")]
    NoDeferralHandler,
    #[error("no message producer")]
    NoMessageProducer,
    #[error("no encryption handler")]
    NoEncryptionHandler,
    #[error("no topics")]
    NoTopics,
    #[error("{0}")]
    Invalid(String),
}

impl Error {
    /// Create a configuration error that is not tied to a topic
    pub fn config(kind: ConfigurationErrorKind) -> Self {
        Error::Configuration { topic: None, kind }
    }

    /// Create a configuration error for a topic
    pub fn topic_config(topic: impl Into<String>, kind: ConfigurationErrorKind) -> Self {
        Error::Configuration {
            topic: Some(topic.into()),
            kind,
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Error::config(ConfigurationErrorKind::Invalid(msg.into()))
    }

    /// Create a broker client error for the named operation
    pub fn api(operation: &'static str, source: ApiError) -> Self {
        Error::Api { operation, source }
    }

    /// Create a handler error
    pub fn handler(err: anyhow::Error) -> Self {
        Error::Handler(SharedError::new(err))
    }

    /// Create an encryption handler error
    pub fn encryption(err: anyhow::Error) -> Self {
        Error::Encryption(SharedError::new(err))
    }

    /// Wrap an error raised while producing on behalf of a consumer
    pub fn producer(err: Error) -> Self {
        Error::Producer(Box::new(err))
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: &'static str, state: impl fmt::Display) -> Self {
        Error::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// True if this is a handler error raised as a [`FatalHandlerError`]
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Handler(e) => e.downcast_ref::<FatalHandlerError>().is_some(),
            _ => false,
        }
    }
}

/// Convert from envconfig::Error to our Error type
impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::invalid_config(err.to_string())
    }
}

/// A cloneable handle on an error raised by application code
#[derive(Debug, Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// The underlying error
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for SharedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        let inner: &(dyn StdError + 'static) = (*self.0).as_ref();
        inner.source()
    }
}

/// A handler error that must not be retried or dead-lettered
///
/// Returning this from a handler stops the consumer without committing the
/// message, regardless of any retry policy or dead-letter topic.
#[derive(Error, Debug)]
#[error("fatal error: {reason}: {source}")]
pub struct FatalHandlerError {
    pub reason: String,
    #[source]
    pub source: Box<dyn StdError + Send + Sync + 'static>,
}

impl FatalHandlerError {
    pub fn new(
        reason: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            reason: reason.into(),
            source: source.into(),
        }
    }
}
