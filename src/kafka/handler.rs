//! Message handlers
//!
//! A [`MessageHandler`] pairs the application function for a topic with the
//! retry and dead-letter configuration applied when that function fails.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::deferral::DeferralHandler;
use super::retry::RetryPolicy;
use crate::models::Message;

/// Application code that handles a message
#[async_trait]
pub trait Handle: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Adapts an async closure taking an owned [`Message`] into a [`Handle`]
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a message handling function
///
/// ```
/// use topicflow::kafka::{handler_fn, MessageHandler};
///
/// let handler = MessageHandler::new(handler_fn(|msg| async move {
///     println!("{}", msg);
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handle for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.0)(message.clone()).await
    }
}

/// Handling configuration for one topic
#[derive(Clone)]
pub struct MessageHandler {
    pub(crate) func: Arc<dyn Handle>,
    pub retry_topic: Option<String>,
    pub dead_letter_topic: Option<String>,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub deferral_handler: Option<Arc<dyn DeferralHandler>>,
}

impl MessageHandler {
    pub fn new(func: impl Handle + 'static) -> Self {
        Self {
            func: Arc::new(func),
            retry_topic: None,
            dead_letter_topic: None,
            retry_policy: None,
            deferral_handler: None,
        }
    }

    /// Topic that retries are produced to; the handler also consumes it
    pub fn with_retry_topic(mut self, topic: impl Into<String>) -> Self {
        self.retry_topic = Some(topic.into());
        self
    }

    /// Topic that messages go to once they will no longer be retried
    pub fn with_dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn with_deferral_handler(mut self, handler: impl DeferralHandler + 'static) -> Self {
        self.deferral_handler = Some(Arc::new(handler));
        self
    }

    /// True if failed or deferred messages of this handler are produced
    /// somewhere
    pub(crate) fn needs_producer(&self) -> bool {
        self.retry_topic.is_some()
            || self.dead_letter_topic.is_some()
            || self.retry_policy.is_some()
            || self
                .deferral_handler
                .as_ref()
                .is_some_and(|deferral| deferral.needs_producer())
    }

    pub async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self.func.handle(message).await
    }
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("retry_topic", &self.retry_topic)
            .field("dead_letter_topic", &self.dead_letter_topic)
            .field(
                "retry_policy",
                &self.retry_policy.as_ref().map(ToString::to_string),
            )
            .field("deferral_handler", &self.deferral_handler.is_some())
            .finish()
    }
}

/// Handlers by the topic they consume, including retry topics
#[derive(Clone, Debug, Default)]
pub(crate) struct HandlerMap(HashMap<String, Arc<MessageHandler>>);

impl HandlerMap {
    pub fn insert(&mut self, topic: impl Into<String>, handler: Arc<MessageHandler>) {
        self.0.insert(topic.into(), handler);
    }

    pub fn get(&self, topic: &str) -> Option<Arc<MessageHandler>> {
        self.0.get(topic).cloned()
    }

    /// Every topic with a handler, sorted and without duplicates
    pub fn topics(&self) -> Vec<String> {
        self.0
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::deferral::{ReprocessMessage, ReproduceMessage};
    use crate::kafka::retry::LinearRetryPolicy;
    use std::time::Duration;

    fn noop() -> MessageHandler {
        MessageHandler::new(handler_fn(|_| async { Ok(()) }))
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = MessageHandler::new(handler_fn(|msg: Message| async move {
            anyhow::ensure!(msg.value == b"ok", "bad value");
            Ok(())
        }));

        assert!(handler.handle(&Message::new("t", "ok")).await.is_ok());
        assert!(handler.handle(&Message::new("t", "nope")).await.is_err());
    }

    #[test]
    fn test_needs_producer() {
        assert!(!noop().needs_producer());
        assert!(noop().with_dead_letter_topic("dlq").needs_producer());
        assert!(noop()
            .with_retry_policy(LinearRetryPolicy::new(Duration::from_secs(1), 1))
            .needs_producer());
        assert!(noop()
            .with_deferral_handler(ReproduceMessage::default())
            .needs_producer());
        assert!(!noop()
            .with_deferral_handler(ReprocessMessage::default())
            .needs_producer());
    }

    #[test]
    fn test_topics_are_sorted_and_unique() {
        let shared = Arc::new(noop());
        let mut map = HandlerMap::default();
        map.insert("b", Arc::clone(&shared));
        map.insert("a", Arc::clone(&shared));
        map.insert("b", shared);

        assert_eq!(map.len(), 2);
        assert_eq!(map.topics(), vec!["a".to_string(), "b".to_string()]);
        assert!(map.get("c").is_none());
    }
}
