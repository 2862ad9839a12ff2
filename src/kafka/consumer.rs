//! Consumer lifecycle
//!
//! A [`Consumer`] is configured with a handler per topic, then started with
//! [`Consumer::run`]. Running validates the configuration, connects,
//! subscribes to every origin and retry topic and hands the broker session
//! to a dispatch task that keeps going until stopped or until an error
//! occurs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::rdkafka::RdKafkaConsumer;
use super::api::{ConsumerApi, RebalanceEvent, RebalanceHandler};
use super::deferral::DeferralHandler;
use super::encryption::EncryptionHandler;
use super::handler::{HandlerMap, MessageHandler};
use super::processor::{lock, MessageProcessor, Status};
use super::producer::MessageProducer;
use super::retry::RetryPolicy;
use super::{Defaults, KafkaConfig};
use crate::error::{ConfigurationErrorKind, Error, Result};
use crate::models::Offset;

/// Lifecycle of a [`Consumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initialising,
    Running,
    Stopped,
    StoppedWithError,
    Closed,
    InitialiseFailed,
    ConnectFailed,
    SubscribeFailed,
    CloseFailed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Initialising => "Initialising",
            ConsumerState::Running => "Running",
            ConsumerState::Stopped => "Stopped",
            ConsumerState::StoppedWithError => "StoppedWithError",
            ConsumerState::Closed => "Closed",
            ConsumerState::InitialiseFailed => "InitialiseFailed",
            ConsumerState::ConnectFailed => "ConnectFailed",
            ConsumerState::SubscribeFailed => "SubscribeFailed",
            ConsumerState::CloseFailed => "CloseFailed",
        };
        f.write_str(name)
    }
}

/// Everything the dispatch task needs, resolved from the consumer's settings
struct Resolved {
    handlers: HandlerMap,
    encryption: Arc<dyn EncryptionHandler>,
    producer: Option<Arc<dyn MessageProducer>>,
}

pub struct Consumer {
    config: KafkaConfig,
    api: Option<Box<dyn ConsumerApi>>,
    handlers: BTreeMap<String, MessageHandler>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    deferral_handler: Option<Arc<dyn DeferralHandler>>,
    encryption_handler: Option<Arc<dyn EncryptionHandler>>,
    message_producer: Option<Arc<dyn MessageProducer>>,
    defaults: Defaults,
    on_rebalance: Option<RebalanceHandler>,
    stop_on_interrupt: bool,
    status: Arc<Mutex<Status>>,
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    interrupt: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Create a consumer over the given broker client
    pub fn new(config: KafkaConfig, api: Box<dyn ConsumerApi>) -> Self {
        Self {
            config,
            api: Some(api),
            handlers: BTreeMap::new(),
            retry_policy: None,
            deferral_handler: None,
            encryption_handler: None,
            message_producer: None,
            defaults: Defaults::default(),
            on_rebalance: None,
            stop_on_interrupt: true,
            status: Arc::new(Mutex::new(Status::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            task: None,
            interrupt: None,
        }
    }

    /// Create a consumer over librdkafka
    pub fn with_rdkafka(config: KafkaConfig) -> Self {
        Self::new(config, Box::new(RdKafkaConsumer::default()))
    }

    /// Handle messages from `topic`, replacing any handler already set for it
    pub fn with_handler(mut self, topic: impl Into<String>, handler: MessageHandler) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    /// Retry policy for handlers that do not have their own
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Deferral handler for handlers that do not have their own
    pub fn with_deferral_handler(mut self, handler: impl DeferralHandler + 'static) -> Self {
        self.deferral_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_encryption_handler(mut self, handler: impl EncryptionHandler + 'static) -> Self {
        self.encryption_handler = Some(Arc::new(handler));
        self
    }

    /// Producer for retries, dead letters and reproduced messages
    pub fn with_message_producer(mut self, producer: Arc<dyn MessageProducer>) -> Self {
        self.message_producer = Some(producer);
        self
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Call `f` whenever partitions are assigned or revoked
    pub fn on_rebalance<F>(mut self, f: F) -> Self
    where
        F: Fn(RebalanceEvent, &[Offset]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_rebalance = Some(Arc::new(f));
        self
    }

    /// Stop the consumer on Ctrl-C (on by default)
    pub fn stop_on_interrupt(mut self, enabled: bool) -> Self {
        self.stop_on_interrupt = enabled;
        self
    }

    pub fn state(&self) -> ConsumerState {
        lock(&self.status).state
    }

    /// Errors recorded so far, oldest first
    pub fn errors(&self) -> Vec<Error> {
        lock(&self.status).errors.clone()
    }

    /// Validate, connect and subscribe, then start the dispatch task
    ///
    /// Returns once the task is running; use [`wait`](Self::wait) to wait
    /// for it to finish.
    pub async fn run(&mut self) -> Result<()> {
        let state = self.state();
        if state != ConsumerState::Initialising {
            return Err(Error::invalid_state("Run", state));
        }

        let resolved = self
            .initialise()
            .map_err(|e| lock(&self.status).fail(ConsumerState::InitialiseFailed, e))?;
        let mut api = self
            .api
            .take()
            .ok_or_else(|| Error::invalid_state("Run", state))?;

        api.create(&self.config.build_consumer_config()).map_err(|e| {
            lock(&self.status).fail(ConsumerState::ConnectFailed, Error::api("Create", e))
        })?;

        let topics = resolved.handlers.topics();
        api.subscribe(&topics, self.on_rebalance.clone()).map_err(|e| {
            lock(&self.status).fail(ConsumerState::SubscribeFailed, Error::api("Subscribe", e))
        })?;
        info!(group_id = %self.config.group_id, topics = ?topics, "consumer subscribed");

        if self.stop_on_interrupt {
            let shutdown = Arc::clone(&self.shutdown);
            self.interrupt = Some(tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping consumer");
                    shutdown.store(true, Ordering::Relaxed);
                }
            }));
        }

        lock(&self.status).state = ConsumerState::Running;

        let processor = MessageProcessor {
            api,
            handlers: Arc::new(resolved.handlers),
            encryption: resolved.encryption,
            producer: resolved.producer,
            group_id: self.config.group_id.clone(),
            async_commit: self.config.async_commit,
            read_timeout: self.config.read_timeout(),
            seek_timeout: self.config.seek_timeout(),
            status: Arc::clone(&self.status),
            shutdown: Arc::clone(&self.shutdown),
        };
        self.task = Some(tokio::spawn(processor.run()));
        Ok(())
    }

    /// Resolve handlers and collaborators, checking nothing needed is missing
    fn initialise(&self) -> Result<Resolved> {
        if self.handlers.is_empty() {
            return Err(Error::config(ConfigurationErrorKind::NoMessageHandlers));
        }

        let encryption = self
            .encryption_handler
            .clone()
            .or_else(|| self.defaults.encryption_handler.clone())
            .ok_or_else(|| Error::config(ConfigurationErrorKind::NoEncryptionHandler))?;

        let mut handlers = HandlerMap::default();
        let mut needs_producer = false;
        for (topic, handler) in &self.handlers {
            let mut handler = handler.clone();
            if handler.deferral_handler.is_none() {
                handler.deferral_handler = self.deferral_handler.clone();
            }

            if let Some(retry_topic) = handler.retry_topic.clone() {
                if handler.retry_policy.is_none() {
                    handler.retry_policy = self.retry_policy.clone();
                }
                if handler.retry_policy.is_none() {
                    return Err(Error::topic_config(
                        topic.clone(),
                        ConfigurationErrorKind::NoRetryPolicy,
                    ));
                }
                if handler.deferral_handler.is_none() {
                    return Err(Error::topic_config(
                        topic.clone(),
                        ConfigurationErrorKind::NoDeferralHandler,
                    ));
                }
                if retry_topic != *topic {
                    handlers.insert(retry_topic, Arc::new(handler.clone()));
                }
            }

            needs_producer |= handler.needs_producer();
            debug!(topic = %topic, handler = ?handler, "handler registered");
            handlers.insert(topic.clone(), Arc::new(handler));
        }

        let producer = self
            .message_producer
            .clone()
            .or_else(|| self.defaults.message_producer.clone());
        if needs_producer && producer.is_none() {
            return Err(Error::config(ConfigurationErrorKind::NoMessageProducer));
        }

        Ok(Resolved {
            handlers,
            encryption,
            producer,
        })
    }

    /// Ask the dispatch task to stop after the message in hand
    pub fn stop(&self) {
        debug!("consumer stop requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the dispatch task to finish
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                crate::log_error!(e, "consumer task failed");
            }
        }
        if let Some(listener) = self.interrupt.take() {
            listener.abort();
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(listener) = self.interrupt.take() {
            listener.abort();
        }
        if self.task.is_some() && self.state() == ConsumerState::Running {
            warn!("consumer dropped while running");
        }
    }
}
