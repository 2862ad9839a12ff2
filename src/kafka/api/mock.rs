//! Scripted in-memory broker clients
//!
//! Both mocks are cheap handles over shared state: keep a clone to script
//! messages and failures and to inspect what the engine did with the client.

use async_trait::async_trait;
use rdkafka::ClientConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::{ApiError, ApiMessage, ConsumerApi, DeliveryEvent, ProducerApi, RebalanceHandler};
use crate::models::{CommitIntent, Offset};

/// Error text returned by [`MockConsumerApi`] once its messages are used up
pub const NO_MORE_MESSAGES: &str = "no more messages";

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ConsumerState {
    messages: VecDeque<Result<ApiMessage, ApiError>>,
    idle_when_drained: bool,
    config: Option<ClientConfig>,
    subscriptions: Vec<String>,
    on_rebalance: Option<RebalanceHandler>,
    assignments: Vec<Option<Vec<String>>>,
    seeks: Vec<Offset>,
    commits: Vec<(Offset, CommitIntent)>,
    closed: bool,
    failures: HashMap<&'static str, ApiError>,
}

/// Mock consumer client
///
/// Messages are delivered in the order they were added. Once they are used
/// up reads fail with [`NO_MORE_MESSAGES`], or time out if
/// [`idle_when_drained`](Self::idle_when_drained) was called.
#[derive(Clone, Default)]
pub struct MockConsumerApi {
    state: Arc<Mutex<ConsumerState>>,
}

impl MockConsumerApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue messages to be read in order
    pub fn with_messages(self, messages: impl IntoIterator<Item = ApiMessage>) -> Self {
        for message in messages {
            self.push_message(message);
        }
        self
    }

    pub fn push_message(&self, message: ApiMessage) {
        lock(&self.state).messages.push_back(Ok(message));
    }

    /// Queue a read error
    pub fn push_error(&self, error: ApiError) {
        lock(&self.state).messages.push_back(Err(error));
    }

    /// Time out instead of failing once the queued messages are used up
    pub fn idle_when_drained(self) -> Self {
        lock(&self.state).idle_when_drained = true;
        self
    }

    /// Make every call to `operation` fail with `error`
    ///
    /// Operation names are `Create`, `Subscribe`, `Assign`, `Seek`, `Commit`
    /// and `Close`.
    pub fn fail(&self, operation: &'static str, error: ApiError) {
        lock(&self.state).failures.insert(operation, error);
    }

    pub fn config(&self) -> Option<ClientConfig> {
        lock(&self.state).config.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn assignments(&self) -> Vec<Option<Vec<String>>> {
        lock(&self.state).assignments.clone()
    }

    pub fn seeks(&self) -> Vec<Offset> {
        lock(&self.state).seeks.clone()
    }

    pub fn commits(&self) -> Vec<(Offset, CommitIntent)> {
        lock(&self.state).commits.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Invoke the rebalance handler passed to `subscribe`, if any
    pub fn rebalance(
        &self,
        event: super::RebalanceEvent,
        offsets: &[Offset],
    ) -> Option<anyhow::Result<()>> {
        let handler = lock(&self.state).on_rebalance.clone();
        handler.map(|handler| handler(event, offsets))
    }

    fn check(&self, operation: &'static str) -> Result<(), ApiError> {
        match lock(&self.state).failures.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConsumerApi for MockConsumerApi {
    fn create(&mut self, config: &ClientConfig) -> Result<(), ApiError> {
        self.check("Create")?;
        lock(&self.state).config = Some(config.clone());
        Ok(())
    }

    fn subscribe(
        &mut self,
        topics: &[String],
        on_rebalance: Option<RebalanceHandler>,
    ) -> Result<(), ApiError> {
        self.check("Subscribe")?;
        let mut state = lock(&self.state);
        state.subscriptions = topics.to_vec();
        state.on_rebalance = on_rebalance;
        Ok(())
    }

    fn assign(&mut self, topics: Option<&[String]>) -> Result<(), ApiError> {
        self.check("Assign")?;
        lock(&self.state).assignments.push(topics.map(<[String]>::to_vec));
        Ok(())
    }

    async fn read_message(&mut self, timeout: Duration) -> Result<ApiMessage, ApiError> {
        let (next, idle) = {
            let mut state = lock(&self.state);
            (state.messages.pop_front(), state.idle_when_drained)
        };
        match next {
            Some(result) => result,
            None if idle => {
                tokio::time::sleep(timeout).await;
                Err(ApiError::Timeout)
            }
            None => Err(ApiError::other(NO_MORE_MESSAGES)),
        }
    }

    fn seek(&mut self, offset: &Offset, _timeout: Duration) -> Result<(), ApiError> {
        self.check("Seek")?;
        lock(&self.state).seeks.push(offset.clone());
        Ok(())
    }

    fn commit(&mut self, offset: &Offset, intent: CommitIntent) -> Result<(), ApiError> {
        self.check("Commit")?;
        lock(&self.state).commits.push((offset.clone(), intent));
        Ok(())
    }

    fn close(&mut self) -> Result<(), ApiError> {
        self.check("Close")?;
        lock(&self.state).closed = true;
        Ok(())
    }
}

struct ProducerState {
    config: Option<ClientConfig>,
    produced: Vec<ApiMessage>,
    next_offsets: HashMap<(String, i32), i64>,
    scripted: VecDeque<DeliveryEvent>,
    delivery_error: Option<ApiError>,
    failures: HashMap<&'static str, ApiError>,
    outstanding: usize,
    events_tx: Option<mpsc::UnboundedSender<DeliveryEvent>>,
    events_rx: Option<mpsc::UnboundedReceiver<DeliveryEvent>>,
    closed: bool,
}

/// Mock producer client
///
/// Every produced message is recorded and immediately confirmed, assigning
/// sequential offsets per partition (partition 0 unless the message names
/// one). Scripted events, when queued, are reported instead.
#[derive(Clone)]
pub struct MockProducerApi {
    state: Arc<Mutex<ProducerState>>,
}

impl Default for MockProducerApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProducerApi {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(ProducerState {
                config: None,
                produced: Vec::new(),
                next_offsets: HashMap::new(),
                scripted: VecDeque::new(),
                delivery_error: None,
                failures: HashMap::new(),
                outstanding: 0,
                events_tx: Some(tx),
                events_rx: Some(rx),
                closed: false,
            })),
        }
    }

    /// Report `event` for the next produced message instead of a confirmation
    pub fn script(&self, event: DeliveryEvent) {
        lock(&self.state).scripted.push_back(event);
    }

    /// Reject every produced message at delivery with `error`
    pub fn reject_deliveries(&self, error: ApiError) {
        lock(&self.state).delivery_error = Some(error);
    }

    /// Make every call to `operation` (`Create` or `Produce`) fail with `error`
    pub fn fail(&self, operation: &'static str, error: ApiError) {
        lock(&self.state).failures.insert(operation, error);
    }

    /// Number of messages `flush` reports as still outstanding
    pub fn set_outstanding(&self, n: usize) {
        lock(&self.state).outstanding = n;
    }

    /// Push an event onto the shared event stream
    pub fn emit(&self, event: DeliveryEvent) {
        if let Some(tx) = &lock(&self.state).events_tx {
            let _ = tx.send(event);
        }
    }

    /// End the shared event stream
    pub fn end_events(&self) {
        lock(&self.state).events_tx = None;
    }

    pub fn config(&self) -> Option<ClientConfig> {
        lock(&self.state).config.clone()
    }

    pub fn produced(&self) -> Vec<ApiMessage> {
        lock(&self.state).produced.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn check(&self, operation: &'static str) -> Result<(), ApiError> {
        match lock(&self.state).failures.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl ProducerApi for MockProducerApi {
    fn create(&mut self, config: &ClientConfig) -> Result<(), ApiError> {
        self.check("Create")?;
        lock(&self.state).config = Some(config.clone());
        Ok(())
    }

    fn produce(
        &self,
        mut message: ApiMessage,
        delivery: Option<oneshot::Sender<DeliveryEvent>>,
    ) -> Result<(), ApiError> {
        self.check("Produce")?;

        let mut state = lock(&self.state);
        let event = match state.scripted.pop_front() {
            Some(event) => event,
            None => {
                let partition = message.partition.unwrap_or(0);
                let next = state
                    .next_offsets
                    .entry((message.topic.clone(), partition))
                    .or_insert(0);
                message.partition = Some(partition);
                message.offset = Some(*next);
                *next += 1;
                DeliveryEvent::Message {
                    message: message.clone(),
                    error: state.delivery_error.clone(),
                }
            }
        };
        state.produced.push(message);

        match delivery {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => {
                if let Some(tx) = &state.events_tx {
                    let _ = tx.send(event);
                }
            }
        }
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> usize {
        lock(&self.state).outstanding
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DeliveryEvent>> {
        lock(&self.state).events_rx.take()
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.events_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::api::RebalanceEvent;

    fn message(topic: &str) -> ApiMessage {
        ApiMessage {
            topic: topic.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_consumer_reads_in_order_then_fails() {
        let mut api = MockConsumerApi::new().with_messages([message("a"), message("b")]);

        assert_eq!(api.read_message(Duration::ZERO).await.unwrap().topic, "a");
        assert_eq!(api.read_message(Duration::ZERO).await.unwrap().topic, "b");
        let err = api.read_message(Duration::ZERO).await.unwrap_err();
        assert_eq!(err.to_string(), NO_MORE_MESSAGES);
    }

    #[tokio::test]
    async fn test_consumer_idles_when_drained() {
        let mut api = MockConsumerApi::new().idle_when_drained();
        let err = api
            .read_message(Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Timeout));
    }

    #[test]
    fn test_consumer_failures_and_rebalance() {
        let mut api = MockConsumerApi::new();
        api.fail("Commit", ApiError::other("commit failed"));

        assert!(api
            .commit(&Offset::new("a", 0, 1), CommitIntent::ReadNext)
            .is_err());
        assert!(api.commits().is_empty());

        let handler: RebalanceHandler = Arc::new(|_: RebalanceEvent, offsets: &[Offset]| {
            anyhow::ensure!(!offsets.is_empty(), "no offsets");
            Ok(())
        });
        api.subscribe(&["a".to_string()], Some(handler)).unwrap();
        let result = api.rebalance(RebalanceEvent::AssignedPartitions, &[]);
        assert!(result.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_producer_confirms_with_sequential_offsets() {
        let api = MockProducerApi::new();

        for expected in 0..2 {
            let (tx, rx) = oneshot::channel();
            api.produce(message("a"), Some(tx)).unwrap();
            match rx.await.unwrap() {
                DeliveryEvent::Message { message, error } => {
                    assert!(error.is_none());
                    assert_eq!(message.offset, Some(expected));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(api.produced().len(), 2);
    }

    #[tokio::test]
    async fn test_producer_without_channel_reports_on_event_stream() {
        let api = MockProducerApi::new();
        let mut events = api.take_events().unwrap();
        assert!(api.take_events().is_none());

        api.produce(message("a"), None).unwrap();
        assert!(matches!(
            events.recv().await,
            Some(DeliveryEvent::Message { .. })
        ));

        api.close();
        assert!(events.recv().await.is_none());
    }
}
