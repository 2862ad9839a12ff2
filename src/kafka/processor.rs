//! Per-message dispatch for a running consumer
//!
//! A [`MessageProcessor`] owns the broker session once a consumer is running.
//! Each message read is decrypted, deferred or handled, and then retried,
//! dead-lettered or committed depending on the outcome.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use super::api::{ApiError, ConsumerApi};
use super::consumer::ConsumerState;
use super::deferral::{ConsumerHandle, DeferOutcome};
use super::encryption::EncryptionHandler;
use super::handler::{HandlerMap, MessageHandler};
use super::producer::MessageProducer;
use crate::error::{ConfigurationErrorKind, Error, Result};
use crate::logging::Timer;
use crate::models::{CommitIntent, Message, Offset};

/// Consumer state and the errors recorded against it
#[derive(Debug)]
pub(crate) struct Status {
    pub state: ConsumerState,
    pub errors: Vec<Error>,
}

impl Status {
    pub fn new() -> Self {
        Self {
            state: ConsumerState::Initialising,
            errors: Vec::new(),
        }
    }

    /// Record `err` and move to `state`, handing the error back
    pub fn fail(&mut self, state: ConsumerState, err: Error) -> Error {
        self.state = state;
        self.errors.push(err.clone());
        err
    }
}

pub(crate) fn lock(status: &Mutex<Status>) -> MutexGuard<'_, Status> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs the dispatch loop for a consumer
pub(crate) struct MessageProcessor {
    pub api: Box<dyn ConsumerApi>,
    pub handlers: Arc<HandlerMap>,
    pub encryption: Arc<dyn EncryptionHandler>,
    pub producer: Option<Arc<dyn MessageProducer>>,
    pub group_id: String,
    pub async_commit: bool,
    pub read_timeout: Duration,
    pub seek_timeout: Duration,
    pub status: Arc<Mutex<Status>>,
    pub shutdown: Arc<AtomicBool>,
}

impl MessageProcessor {
    /// Read and handle messages until stopped or an error occurs, then close
    /// the broker session
    pub async fn run(mut self) {
        info!(group_id = %self.group_id, "consumer running");

        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.next().await {
                break Err(e);
            }
        };

        {
            let mut status = lock(&self.status);
            match result {
                Ok(()) => status.state = ConsumerState::Stopped,
                Err(e) => {
                    crate::log_error!(e, "consumer stopped", group_id = self.group_id);
                    status.fail(ConsumerState::StoppedWithError, e);
                }
            }
        }

        let closed = self.api.close();
        let mut status = lock(&self.status);
        match closed {
            Ok(()) => {
                status.state = ConsumerState::Closed;
                info!(group_id = %self.group_id, "consumer closed");
            }
            Err(e) => {
                let err = status.fail(ConsumerState::CloseFailed, Error::api("Close", e));
                warn!(error = %err, "consumer close failed");
            }
        }
    }

    /// Read one message and see it through to its commit
    async fn next(&mut self) -> Result<()> {
        let raw = match self.api.read_message(self.read_timeout).await {
            Ok(raw) => raw,
            Err(ApiError::Timeout) => return Ok(()),
            Err(e) => return Err(Error::api("ReadMessage", e)),
        };

        let offset = raw.address();
        let mut message = Message::from(raw);
        if let Err(e) = self.encryption.decrypt(&mut message) {
            warn!(offset = %offset, "message could not be decrypted");
            return Err(Error::encryption(e));
        }

        let handler = self.handlers.get(&message.topic).ok_or_else(|| {
            Error::topic_config(message.topic.clone(), ConfigurationErrorKind::NoHandlerForTopic)
        })?;

        let span = crate::kafka_span!(self.group_id, offset.topic, offset.partition, offset.offset);
        let outcome = self.handle_message(&handler, &message).instrument(span).await?;

        match outcome {
            DeferOutcome::Reprocess => {
                debug!(offset = %offset, "commit skipped, message will be read again");
            }
            DeferOutcome::Commit if self.async_commit => {}
            DeferOutcome::Commit => {
                self.api
                    .commit(&offset, CommitIntent::ReadNext)
                    .map_err(|e| Error::api("Commit", e))?;
            }
        }
        Ok(())
    }

    /// Defer or handle a message, producing a retry or dead letter when the
    /// handler fails
    pub async fn handle_message(
        &mut self,
        handler: &MessageHandler,
        message: &Message,
    ) -> Result<DeferOutcome> {
        if message.should_defer() {
            if let Some(deferral) = handler.deferral_handler.clone() {
                debug!(deferral = ?message.deferral(), age = ?message.age, "message deferred");
                return deferral.defer(self, message).await;
            }
        }

        let timer = Timer::start("handle");
        let result = handler.handle(message).await;
        tracing::Span::current().record("processing_time_ms", timer.stop().as_millis() as u64);

        let err = match result {
            Ok(()) => return Ok(DeferOutcome::Commit),
            Err(e) => Error::handler(e),
        };
        if err.is_fatal() {
            return Err(err);
        }

        if let Some(policy) = handler.retry_policy.as_ref().filter(|p| p.should_retry(message)) {
            tracing::Span::current().record("retry", policy.to_string().as_str());

            let (_, attempt, num) = message.retry_attempt();
            let mut retry = message.new_copy();
            retry.topic = handler
                .retry_topic
                .clone()
                .unwrap_or_else(|| message.topic.clone());
            retry.set_retry_headers(attempt, num + 1);
            retry.defer_for(policy.retry_delay(&retry));

            let offset = self.must_produce(retry).await.map_err(Error::producer)?;
            warn!(error = %err, retry = %offset, "handler failed, message retried");
            return Ok(DeferOutcome::Commit);
        }

        if let Some(topic) = &handler.dead_letter_topic {
            let mut dead = message.new_copy();
            dead.topic = topic.clone();

            let offset = self.must_produce(dead).await.map_err(Error::producer)?;
            warn!(error = %err, dead_letter = %offset, "handler failed, message dead-lettered");
            return Ok(DeferOutcome::Commit);
        }

        Err(err)
    }
}

#[async_trait]
impl ConsumerHandle for MessageProcessor {
    fn seek(&mut self, offset: &Offset) -> Result<()> {
        self.api
            .seek(offset, self.seek_timeout)
            .map_err(|e| Error::api("Seek", e))
    }

    async fn must_produce(&mut self, message: Message) -> Result<Offset> {
        match &self.producer {
            Some(producer) => producer.must_produce(message).await,
            None => Err(Error::config(ConfigurationErrorKind::NoMessageProducer)),
        }
    }
}
